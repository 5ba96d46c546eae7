//! # Channel Transport
//!
//! Two connected in-memory transports. Each envelope crosses the channel as
//! its JSON wire value, so the receiving bus validates it exactly as it
//! would a message from a real link.
//!
//! Messages sent before the other side installs its inbound handler wait in
//! the channel. Installing the handler spawns a forwarding task, so
//! `on_message` must run inside a Tokio runtime.

use crate::ports::{InboundHandler, MessageContext, Transport};
use parking_lot::Mutex;
use peerbus_types::{BusError, Envelope, ErrorKind};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// One end of an in-memory link.
pub struct ChannelTransport {
    outbox: mpsc::UnboundedSender<Value>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    handler: Arc<Mutex<Option<InboundHandler>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    /// Origin stamped on everything this end receives.
    remote_origin: Option<String>,
    closed: AtomicBool,
    sent: AtomicU64,
}

impl ChannelTransport {
    /// Build a connected pair. Messages arriving at the first end carry
    /// `origin_b` and vice versa.
    #[must_use]
    pub fn pair(origin_a: Option<&str>, origin_b: Option<&str>) -> (Arc<Self>, Arc<Self>) {
        let (to_b, from_a) = mpsc::unbounded_channel();
        let (to_a, from_b) = mpsc::unbounded_channel();
        let a = Self::new(to_b, from_b, origin_b.map(str::to_string));
        let b = Self::new(to_a, from_a, origin_a.map(str::to_string));
        (Arc::new(a), Arc::new(b))
    }

    fn new(
        outbox: mpsc::UnboundedSender<Value>,
        inbox: mpsc::UnboundedReceiver<Value>,
        remote_origin: Option<String>,
    ) -> Self {
        Self {
            outbox,
            inbox: Mutex::new(Some(inbox)),
            handler: Arc::new(Mutex::new(None)),
            forwarder: Mutex::new(None),
            remote_origin,
            closed: AtomicBool::new(false),
            sent: AtomicU64::new(0),
        }
    }

    /// Push a raw value, bypassing envelope encoding.
    ///
    /// # Errors
    ///
    /// `PEER_DISCONNECTED` once either end is closed.
    pub fn send_raw(&self, value: Value) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.outbox.send(value).map_err(|_| closed_error())?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Values successfully handed to the channel.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

fn closed_error() -> BusError {
    BusError::with_message(ErrorKind::PeerDisconnected, "Channel transport closed")
}

impl Transport for ChannelTransport {
    fn send(&self, envelope: &Envelope) -> Result<(), BusError> {
        self.send_raw(envelope.to_value())
    }

    fn on_message(&self, handler: InboundHandler) {
        *self.handler.lock() = Some(handler);

        let Some(mut inbox) = self.inbox.lock().take() else {
            return;
        };
        let slot = Arc::clone(&self.handler);
        let context = MessageContext {
            origin: self.remote_origin.clone(),
        };
        let task = tokio::spawn(async move {
            while let Some(value) = inbox.recv().await {
                let current = slot.lock().clone();
                match current {
                    Some(handler) => handler(value, context.clone()),
                    None => debug!("Channel message dropped; no handler installed"),
                }
            }
        });
        *self.forwarder.lock() = Some(task);
    }

    fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handler.lock().take();
        self.inbox.lock().take();
        if let Some(task) = self.forwarder.lock().take() {
            task.abort();
        }
        debug!("Channel transport destroyed");
    }

    fn kind(&self) -> &str {
        "channel"
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("remote_origin", &self.remote_origin)
            .field("closed", &self.is_closed())
            .field("sent", &self.sent_count())
            .field("handler", &"<closure>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerbus_types::MessageType;
    use serde_json::json;
    use std::time::Duration;

    fn collector() -> (InboundHandler, mpsc::UnboundedReceiver<(Value, MessageContext)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: InboundHandler = Arc::new(move |value, ctx| {
            let _ = tx.send((value, ctx));
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_envelope_crosses_with_remote_origin() {
        let (a, b) = ChannelTransport::pair(Some("https://a.test"), Some("https://b.test"));
        let (handler, mut rx) = collector();
        b.on_message(handler);

        let envelope = Envelope::new(MessageType::Signal, json!({ "name": "e", "data": 1 }));
        a.send(&envelope).unwrap();

        let (value, ctx) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Envelope::from_value(value).unwrap(), envelope);
        assert_eq!(ctx.origin.as_deref(), Some("https://a.test"));
        assert_eq!(a.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_messages_before_handler_are_kept() {
        let (a, b) = ChannelTransport::pair(None, None);
        a.send_raw(json!(1)).unwrap();
        a.send_raw(json!(2)).unwrap();

        let (handler, mut rx) = collector();
        b.on_message(handler);
        assert_eq!(rx.recv().await.unwrap().0, json!(1));
        assert_eq!(rx.recv().await.unwrap().0, json!(2));
    }

    #[tokio::test]
    async fn test_destroy_fails_sends_both_ways() {
        let (a, b) = ChannelTransport::pair(None, None);
        let (handler, _rx) = collector();
        b.on_message(handler);

        a.destroy();
        assert!(a.is_closed());
        assert_eq!(
            a.send_raw(json!("late")).unwrap_err().kind(),
            ErrorKind::PeerDisconnected
        );

        // Dropping a's inbox closes the channel b writes into.
        assert!(b.send_raw(json!("late")).is_err());
        a.destroy();
    }

    #[test]
    fn test_kind() {
        let (a, _b) = ChannelTransport::pair(None, None);
        assert_eq!(a.kind(), "channel");
    }
}
