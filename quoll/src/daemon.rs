//! Daemon-level status module and the reconnect supervisor.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use quoll_core::{Announcer, Connected, Dispatcher, EntityConfig, Module, PubSubHandle, Transport};

use crate::modules::entity_map;

/// Version advertised on the `/version` topic.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Synthetic module publishing daemon-level availability and version.
///
/// Bound to the base topic unscoped; its status entity is the anchor the
/// other entities' availability defaults point at.
pub struct DaemonStatus;

#[async_trait]
impl Module for DaemonStatus {
    async fn sync(&self, ps: PubSubHandle) {
        ps.publish("", "online");
        ps.publish("/version", VERSION);
    }

    async fn close(&self) {}

    fn entities(&self) -> Vec<EntityConfig> {
        vec![EntityConfig::new(
            "status",
            "binary_sensor",
            entity_map(json!({
                "name": "{{node_id}} status",
                "object_id": "{{node_id}}_status",
                "state_topic": "~",
                "device_class": "connectivity",
                "payload_on": "online",
                "payload_off": "offline",
            })),
        )]
    }
}

/// Drive resynchronization for the life of the connection.
///
/// On every transport (re)connect event: re-arm discovery and advertise,
/// re-sync every module, then republish current state after the settle
/// delay so the consumer has registered the advertised entities before it
/// receives state.
pub async fn supervise(
    transport: Arc<Transport>,
    mut events: mpsc::Receiver<Connected>,
    dispatcher: Arc<Dispatcher>,
    announcer: Arc<Announcer>,
    base_topic: String,
) {
    while let Some(Connected) = events.recv().await {
        tracing::info!(base_topic = %base_topic, "transport connected");
        Announcer::connect(&announcer, &transport);
        dispatcher.sync_all(&transport, &base_topic).await;
        if !announcer.is_empty() {
            let dispatcher = dispatcher.clone();
            let settle = announcer.settle_delay();
            tokio::spawn(async move {
                tokio::time::sleep(settle).await;
                dispatcher.publish_all();
            });
        }
    }
}
