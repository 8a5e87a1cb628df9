//! The publish/subscribe contract the core builds on.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Callback invoked with the raw payload of a received message.
pub type Handler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Fire-and-forget publish/subscribe over topics relative to a base topic.
///
/// Relative topics carry a leading `/`; the empty topic addresses the base
/// topic itself. Publishes issued in sequence from one task are forwarded
/// to the transport in order.
pub trait PubSub: Send + Sync {
    fn publish(&self, topic: &str, value: &str);
    fn subscribe(&self, topic: &str, handler: Handler);
}

/// Shared handle to a [`PubSub`] implementation.
pub type PubSubHandle = Arc<dyn PubSub>;

/// No-op implementation used until a sensor is first synchronized.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubPubSub;

impl PubSub for StubPubSub {
    fn publish(&self, _topic: &str, _value: &str) {}

    fn subscribe(&self, _topic: &str, _handler: Handler) {}
}

/// A stub handle.
pub fn stub() -> PubSubHandle {
    Arc::new(StubPubSub)
}

/// A replaceable [`PubSub`] binding.
///
/// The handle is swapped wholesale on every sync; readers clone the
/// current handle and never observe a partial update.
#[derive(Clone)]
pub struct PubSubCell {
    tx: Arc<watch::Sender<PubSubHandle>>,
}

impl PubSubCell {
    /// A cell bound to the stub.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(stub());
        Self { tx: Arc::new(tx) }
    }

    /// Replace the bound handle.
    pub fn replace(&self, ps: PubSubHandle) {
        self.tx.send_replace(ps);
    }

    /// The currently bound handle.
    pub fn get(&self) -> PubSubHandle {
        self.tx.borrow().clone()
    }

    /// Publish through the currently bound handle.
    pub fn publish(&self, topic: &str, value: &str) {
        self.get().publish(topic, value);
    }
}

impl Default for PubSubCell {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PubSubCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubCell").finish_non_exhaustive()
    }
}
