//! Transport kind fallback.
//!
//! The host may ask for a transport kind the connector cannot provide. The
//! request then degrades to [`TransportKind::Auto`] instead of failing.

use crate::traits::TransportKind;
use tracing::warn;

/// Pick the transport kind to start with.
///
/// Returns `requested` when the connector supports it, otherwise `Auto`.
#[must_use]
pub fn negotiate(requested: TransportKind, supported: &[TransportKind]) -> TransportKind {
    if requested == TransportKind::Auto || supported.contains(&requested) {
        return requested;
    }

    warn!(
        requested = %requested,
        "Transport kind not supported, falling back to auto"
    );
    TransportKind::Auto
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_transport() {
        let all = [
            TransportKind::Auto,
            TransportKind::ServerSentEvents,
            TransportKind::LongPolling,
        ];

        // Supported kinds pass through
        assert_eq!(
            negotiate(TransportKind::LongPolling, &all),
            TransportKind::LongPolling
        );

        // Unsupported kinds degrade to auto
        assert_eq!(
            negotiate(TransportKind::ServerSentEvents, &[TransportKind::Auto]),
            TransportKind::Auto
        );

        // Auto needs no support entry
        assert_eq!(negotiate(TransportKind::Auto, &[]), TransportKind::Auto);
    }
}
