//! Entity announcements for the auto-discovery consumer.
//!
//! Each discoverable entity is advertised as a JSON config payload on
//! `<prefix>/<class>/<unique-id>/config`. The consumer signals its own
//! (re)initialization on a trigger topic; announcements are re-published
//! on that signal and once proactively after every transport (re)connect,
//! covering consumers that were already running when we connected.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::config::period;
use crate::error::{Error, Result};
use crate::module::EntityConfig;
use crate::pubsub::PubSubHandle;
use crate::transport::{SubscriptionGuard, Transport};

/// Placeholder substituted with the node identifier after serialization.
pub const NODE_ID_TOKEN: &str = "{{node_id}}";

/// Discovery announcement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Discovery topic prefix. Unset disables discovery entirely.
    pub prefix: Option<String>,

    /// Human-readable node identifier. Defaults to the hostname.
    pub node_id: Option<String>,

    /// Explicit device unique id; derived from the MAC address if unset.
    pub unique_id: Option<String>,

    /// Explicit MAC address, bypassing interface probing.
    pub mac: Option<String>,

    /// Interfaces probed, in order, for a readable hardware address.
    pub mac_source: Vec<String>,

    /// Topic on which the consumer announces its own (re)initialization.
    pub trigger_topic: Option<String>,

    /// Payload that marks the consumer's birth message.
    pub birth_payload: String,

    /// Delay before module state is republished after a (re)announce,
    /// giving the consumer time to register the advertised entities.
    #[serde(with = "period")]
    pub settle_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            node_id: None,
            unique_id: None,
            mac: None,
            mac_source: vec![
                "eth0".to_string(),
                "enp3s0".to_string(),
                "wlan0".to_string(),
            ],
            trigger_topic: None,
            birth_payload: "online".to_string(),
            settle_delay: Duration::from_secs(2),
        }
    }
}

/// The announcement table and its (re)publish triggers.
pub struct Announcer {
    /// Map from discovery topic to finalized JSON payload.
    entries: BTreeMap<String, String>,
    trigger_topic: Option<String>,
    birth_payload: String,
    settle_delay: Duration,
    /// Live trigger subscription, replaced on every (re)connect.
    trigger: Mutex<Option<SubscriptionGuard>>,
}

impl Announcer {
    /// Build the announcement table from the aggregated module entities.
    ///
    /// With no prefix configured the table is empty and every operation
    /// is a no-op. Fails when discovery is enabled but no MAC address
    /// can be determined.
    pub fn build(
        config: &DiscoveryConfig,
        base_topic: &str,
        node_id: &str,
        modules: &[(String, Vec<EntityConfig>)],
    ) -> Result<Self> {
        let mut entries = BTreeMap::new();

        if let Some(prefix) = config.prefix.as_deref().filter(|p| !p.is_empty()) {
            let mac = match &config.mac {
                Some(mac) => mac.clone(),
                None => find_mac(&config.mac_source)?,
            };
            let uid = config
                .unique_id
                .clone()
                .unwrap_or_else(|| format!("quoll-{}", mac.replace(':', "")));

            for (module_name, entities) in modules {
                for entity in entities {
                    let mut entity_uid = uid.clone();
                    if !module_name.is_empty() {
                        entity_uid.push('-');
                        entity_uid.push_str(module_name);
                    }
                    entity_uid.push('-');
                    entity_uid.push_str(&entity.name);

                    let topic = format!("{}/{}/{}/config", prefix, entity.class, entity_uid);
                    let object_id = format!("{}_{}_{}", node_id, module_name, entity.name);
                    let payload = normalize_entity(
                        &entity.config,
                        base_topic,
                        node_id,
                        &mac,
                        &entity_uid,
                        &object_id,
                    )?;
                    entries.insert(topic, payload);
                }
            }
        }

        Ok(Self {
            entries,
            trigger_topic: config.trigger_topic.clone(),
            birth_payload: config.birth_payload.clone(),
            settle_delay: config.settle_delay,
            trigger: Mutex::new(None),
        })
    }

    /// Publish every announcement verbatim. No-op when discovery is
    /// disabled.
    pub fn advertise(&self, ps: &PubSubHandle) {
        if self.entries.is_empty() {
            return;
        }
        tracing::info!(entities = self.entries.len(), "advertising entities");
        for (topic, payload) in &self.entries {
            ps.publish(topic, payload);
        }
    }

    /// Re-arm the trigger subscription and advertise proactively.
    ///
    /// Called on every transport (re)connect.
    pub fn connect(announcer: &Arc<Self>, transport: &Transport) {
        if announcer.entries.is_empty() {
            return;
        }
        let ps = transport.scoped("");
        if let Some(trigger_topic) = &announcer.trigger_topic {
            let on_birth = announcer.clone();
            let reply = ps.clone();
            let birth = announcer.birth_payload.clone();
            let guard = transport.subscribe(
                trigger_topic,
                Arc::new(move |payload| {
                    if payload == birth.as_bytes() {
                        on_birth.advertise(&reply);
                    }
                }),
            );
            *announcer.trigger.lock().unwrap() = Some(guard);
        }
        announcer.advertise(&ps);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The configured settle delay before state republication.
    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// The announcement table, for inspection.
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }
}

/// First readable hardware address among the candidate interfaces.
fn find_mac(sources: &[String]) -> Result<String> {
    for source in sources {
        let path = format!("/sys/class/net/{}/address", source);
        if let Ok(address) = std::fs::read_to_string(&path) {
            let address = address.trim();
            if !address.is_empty() {
                return Ok(address.to_string());
            }
        }
    }
    Err(Error::Discovery(
        "no readable hardware address among mac_source interfaces".to_string(),
    ))
}

/// Complete an entity config with identity defaults and render it.
///
/// Defaults fill in only where the entity did not set the key itself.
/// Entities without any availability rule inherit the base topic as
/// availability topic, except when their state topic is the base topic
/// itself (availability is then intrinsic to daemon connectivity).
fn normalize_entity(
    entity: &Map<String, Value>,
    base_topic: &str,
    node_id: &str,
    mac: &str,
    unique_id: &str,
    object_id: &str,
) -> Result<String> {
    let mut config = entity.clone();

    let defaults = [
        ("~", json!(base_topic)),
        (
            "device",
            json!({
                "name": node_id,
                "connections": [["mac", mac]],
            }),
        ),
        ("unique_id", json!(unique_id)),
        ("object_id", json!(object_id)),
    ];
    for (key, value) in defaults {
        config.entry(key).or_insert(value);
    }

    if !config.contains_key("availability") && !config.contains_key("availability_topic") {
        config.insert("availability_topic".to_string(), json!("~"));
    }
    if config.get("state_topic") == Some(&json!("~")) {
        config.remove("availability_topic");
    }

    let rendered = serde_json::to_string(&Value::Object(config))?;
    Ok(rendered.replace(NODE_ID_TOKEN, node_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingPubSub;

    fn entity(name: &str, class: &str, config: Value) -> EntityConfig {
        let map = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        EntityConfig::new(name, class, map)
    }

    fn enabled_config() -> DiscoveryConfig {
        DiscoveryConfig {
            prefix: Some("discover".to_string()),
            mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_without_prefix() {
        let modules = vec![(
            "cpu".to_string(),
            vec![entity("used", "sensor", json!({ "state_topic": "~/cpu" }))],
        )];
        let announcer =
            Announcer::build(&DiscoveryConfig::default(), "quoll/host", "host", &modules).unwrap();
        assert!(announcer.is_empty());

        let rec = RecordingPubSub::new();
        let ps: PubSubHandle = rec.clone();
        announcer.advertise(&ps);
        assert!(rec.messages().is_empty());
    }

    #[test]
    fn test_missing_mac_is_fatal_when_enabled() {
        let config = DiscoveryConfig {
            prefix: Some("discover".to_string()),
            mac: None,
            mac_source: Vec::new(),
            ..Default::default()
        };
        let modules = vec![("cpu".to_string(), vec![entity("used", "sensor", json!({}))])];
        assert!(Announcer::build(&config, "quoll/host", "host", &modules).is_err());
    }

    #[test]
    fn test_topics_per_entity() {
        let modules = vec![(
            "probe".to_string(),
            vec![
                entity("A", "sensor", json!({ "state_topic": "~/probe" })),
                entity("B", "binary_sensor", json!({ "state_topic": "~/probe" })),
            ],
        )];
        let announcer =
            Announcer::build(&enabled_config(), "quoll/host", "host", &modules).unwrap();

        assert_eq!(announcer.len(), 2);
        let topics: Vec<&String> = announcer.entries().keys().collect();
        assert_eq!(
            topics,
            vec![
                "discover/binary_sensor/quoll-aabbccddeeff-probe-B/config",
                "discover/sensor/quoll-aabbccddeeff-probe-A/config",
            ]
        );
    }

    #[test]
    fn test_build_is_idempotent() {
        let modules = vec![
            (
                "".to_string(),
                vec![entity("status", "binary_sensor", json!({ "state_topic": "~" }))],
            ),
            (
                "cpu".to_string(),
                vec![entity(
                    "used_percent",
                    "sensor",
                    json!({
                        "name": "{{node_id}} CPU used percent",
                        "state_topic": "~/cpu",
                    }),
                )],
            ),
        ];
        let first = Announcer::build(&enabled_config(), "quoll/host", "host", &modules).unwrap();
        let second = Announcer::build(&enabled_config(), "quoll/host", "host", &modules).unwrap();
        assert_eq!(first.entries(), second.entries());
    }

    #[test]
    fn test_normalized_payload_fields() {
        let modules = vec![(
            "cpu".to_string(),
            vec![entity(
                "used_percent",
                "sensor",
                json!({
                    "name": "{{node_id}} CPU used percent",
                    "state_topic": "~/cpu",
                }),
            )],
        )];
        let announcer =
            Announcer::build(&enabled_config(), "quoll/host", "host", &modules).unwrap();

        let payload = announcer
            .entries()
            .get("discover/sensor/quoll-aabbccddeeff-cpu-used_percent/config")
            .unwrap();
        let parsed: Value = serde_json::from_str(payload).unwrap();

        assert_eq!(parsed["~"], "quoll/host");
        assert_eq!(parsed["name"], "host CPU used percent");
        assert_eq!(parsed["unique_id"], "quoll-aabbccddeeff-cpu-used_percent");
        assert_eq!(parsed["object_id"], "host_cpu_used_percent");
        assert_eq!(parsed["availability_topic"], "~");
        assert_eq!(parsed["device"]["name"], "host");
        assert_eq!(parsed["device"]["connections"][0][0], "mac");
        assert_eq!(parsed["device"]["connections"][0][1], "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_base_state_topic_has_no_availability() {
        let modules = vec![(
            "".to_string(),
            vec![entity(
                "status",
                "binary_sensor",
                json!({ "state_topic": "~" }),
            )],
        )];
        let announcer =
            Announcer::build(&enabled_config(), "quoll/host", "host", &modules).unwrap();

        let payload = announcer.entries().values().next().unwrap();
        let parsed: Value = serde_json::from_str(payload).unwrap();
        assert!(parsed.get("availability_topic").is_none());
    }

    #[test]
    fn test_explicit_availability_is_preserved() {
        let modules = vec![(
            "fs".to_string(),
            vec![entity(
                "root_used_percent",
                "sensor",
                json!({
                    "state_topic": "~/fs/root",
                    "availability": [{ "topic": "~" }, { "topic": "~/fs/root" }],
                }),
            )],
        )];
        let announcer =
            Announcer::build(&enabled_config(), "quoll/host", "host", &modules).unwrap();

        let payload = announcer.entries().values().next().unwrap();
        let parsed: Value = serde_json::from_str(payload).unwrap();
        assert!(parsed.get("availability_topic").is_none());
        assert_eq!(parsed["availability"][1]["topic"], "~/fs/root");
    }

    #[test]
    fn test_explicit_unique_id_overrides_mac_derivation() {
        let config = DiscoveryConfig {
            unique_id: Some("den-pi".to_string()),
            ..enabled_config()
        };
        let modules = vec![("cpu".to_string(), vec![entity("used", "sensor", json!({}))])];
        let announcer = Announcer::build(&config, "quoll/host", "host", &modules).unwrap();
        assert!(
            announcer
                .entries()
                .contains_key("discover/sensor/den-pi-cpu-used/config")
        );
    }
}
