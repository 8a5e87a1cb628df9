//! Test doubles shared across the crate's unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::pubsub::{Handler, PubSub};

/// Records publishes and captures subscription handlers.
#[derive(Default)]
pub struct RecordingPubSub {
    messages: Mutex<Vec<(String, String)>>,
    handlers: Mutex<HashMap<String, Handler>>,
}

impl RecordingPubSub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All recorded (topic, value) pairs, in publish order.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    /// Values published to one topic, in publish order.
    pub fn messages_for(&self, topic: &str) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn subscribed(&self, topic: &str) -> bool {
        self.handlers.lock().unwrap().contains_key(topic)
    }

    /// Deliver a payload to the handler subscribed on `topic`.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let handler = self.handlers.lock().unwrap().get(topic).cloned();
        if let Some(handler) = handler {
            handler(payload);
        }
    }
}

impl PubSub for RecordingPubSub {
    fn publish(&self, topic: &str, value: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), value.to_string()));
    }

    fn subscribe(&self, topic: &str, handler: Handler) {
        self.handlers
            .lock()
            .unwrap()
            .insert(topic.to_string(), handler);
    }
}
