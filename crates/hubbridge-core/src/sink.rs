//! The single outbound channel to the host.
//!
//! Every event and reply of every connection is funneled through one
//! unbounded queue, so the host sees them serialized and in arrival order
//! regardless of which thread produced them.

use crate::envelope::{Envelope, Outbound, Reply};
use crate::error::BridgeError;
use futures_util::Stream;
use hubbridge_protocol::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::trace;

/// Producer side of the outbound channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OutboundSink {
    sender: mpsc::UnboundedSender<Outbound>,
}

impl OutboundSink {
    /// Create a connected sink and stream.
    #[must_use]
    pub fn channel() -> (OutboundSink, OutboundStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (OutboundSink { sender }, OutboundStream { receiver })
    }

    /// Enqueue one item. Returns `false` if the consumer is gone.
    pub fn send(&self, item: Outbound) -> bool {
        match self.sender.send(item) {
            Ok(()) => true,
            Err(err) => {
                trace!(item = ?err.0, "Outbound consumer gone, dropping item");
                false
            }
        }
    }

    pub fn event(&self, envelope: Envelope) -> bool {
        self.send(Outbound::Event(envelope))
    }

    pub fn reply(&self, seq: u64, outcome: Result<Value, BridgeError>) -> bool {
        self.send(Outbound::Reply(Reply::new(seq, outcome)))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Consumer side of the outbound channel.
#[derive(Debug)]
pub struct OutboundStream {
    receiver: mpsc::UnboundedReceiver<Outbound>,
}

impl OutboundStream {
    /// Wait for the next item. `None` once every sink is dropped.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.receiver.recv().await
    }

    /// Take the next item if one is queued.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.receiver.try_recv().ok()
    }

    /// Whether no item is queued right now.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Stream for OutboundStream {
    type Item = Outbound;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::LifecycleState;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_items_arrive_in_order() {
        let (sink, mut stream) = OutboundSink::channel();

        assert!(sink.event(Envelope::status("c1", LifecycleState::Connecting, None)));
        assert!(sink.reply(1, Ok(Value::Bool(true))));
        assert!(sink.event(Envelope::new_message("c1", "Tick", vec![])));

        assert!(matches!(stream.recv().await, Some(Outbound::Event(_))));
        assert!(matches!(stream.next().await, Some(Outbound::Reply(_))));
        assert!(matches!(stream.try_recv(), Some(Outbound::Event(_))));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_send_after_consumer_dropped() {
        let (sink, stream) = OutboundSink::channel();
        drop(stream);

        assert!(sink.is_closed());
        assert!(!sink.reply(1, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_stream_ends_when_sinks_dropped() {
        let (sink, mut stream) = OutboundSink::channel();
        let clone = sink.clone();
        drop(sink);
        clone.reply(3, Ok(Value::Null));
        drop(clone);

        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }
}
