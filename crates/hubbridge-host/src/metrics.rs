//! Metrics collection and export for hubbridge.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use hubbridge_core::{Envelope, Outbound};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const COMMANDS_TOTAL: &str = "hubbridge_commands_total";
    pub const EVENTS_TOTAL: &str = "hubbridge_events_total";
    pub const REPLIES_TOTAL: &str = "hubbridge_replies_total";
    pub const CONNECTIONS_ACTIVE: &str = "hubbridge_connections_active";
    pub const FRAME_BYTES: &str = "hubbridge_frame_bytes";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::COMMANDS_TOTAL, "Commands received from the host");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events delivered to the host");
    metrics::describe_counter!(names::REPLIES_TOTAL, "Replies delivered to the host");
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of registered connections"
    );
    metrics::describe_counter!(names::FRAME_BYTES, "Bytes of host frames by direction");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a command from the host.
pub fn record_command(method: &str) {
    counter!(names::COMMANDS_TOTAL, "method" => method.to_string()).increment(1);
}

/// Record an item leaving for the host.
pub fn record_outbound(item: &Outbound) {
    match item {
        Outbound::Event(envelope) => {
            let kind = match envelope {
                Envelope::ConnectionStatus { .. } => "ConnectionStatus",
                Envelope::NewMessage { .. } => "NewMessage",
            };
            counter!(names::EVENTS_TOTAL, "kind" => kind).increment(1);
        }
        Outbound::Reply(reply) => {
            let status = if reply.outcome.is_ok() { "ok" } else { "error" };
            counter!(names::REPLIES_TOTAL, "status" => status).increment(1);
        }
    }
}

/// Update the registered connection count.
pub fn set_active_connections(count: usize) {
    gauge!(names::CONNECTIONS_ACTIVE).set(count as f64);
}

/// Record frame bytes moved over the host channel.
pub fn record_frame_bytes(bytes: usize, direction: &'static str) {
    counter!(names::FRAME_BYTES, "direction" => direction).increment(bytes as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubbridge_core::{LifecycleState, Reply};
    use hubbridge_protocol::Value;

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: every call is a no-op and must not panic.
        record_command("stop");
        record_outbound(&Outbound::Event(Envelope::status(
            "c1",
            LifecycleState::Connected,
            None,
        )));
        record_outbound(&Outbound::Reply(Reply::new(1, Ok(Value::Bool(true)))));
        set_active_connections(3);
        record_frame_bytes(42, "inbound");
    }
}
