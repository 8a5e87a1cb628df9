//! Network interface collector.
//!
//! Each configured interface carries up to two polled sensors: a link
//! sensor over the sysfs `operstate`/`carrier` files, published on
//! change, and a stats sensor over the `statistics/` counters, published
//! every refresh with throughput and packet rates derived from counter
//! deltas.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use quoll_core::config::period_opt;
use quoll_core::{
    EntityConfig, Error, Module, ModuleCtx, PolledSensor, Poller, PubSubCell, PubSubHandle, Result,
};

use super::{entity_map, round2};

const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

const STATS_GAUGES: [&str; 4] = ["rx_bytes", "tx_bytes", "rx_packets", "tx_packets"];

/// Pairing of a rate entity to its underlying counter.
struct RateSpec {
    rate: &'static str,
    gauge: &'static str,
    scaling: f64,
}

const STATS_RATES: [RateSpec; 4] = [
    RateSpec {
        rate: "rx_throughput",
        gauge: "rx_bytes",
        scaling: 8.0,
    },
    RateSpec {
        rate: "tx_throughput",
        gauge: "tx_bytes",
        scaling: 8.0,
    },
    RateSpec {
        rate: "rx_packet_rate",
        gauge: "rx_packets",
        scaling: 1.0,
    },
    RateSpec {
        rate: "tx_packet_rate",
        gauge: "tx_packets",
        scaling: 1.0,
    },
];

const STATS_ENTITIES: [&str; 8] = [
    "rx_bytes",
    "tx_bytes",
    "rx_throughput",
    "tx_throughput",
    "rx_packets",
    "tx_packets",
    "rx_packet_rate",
    "tx_packet_rate",
];

const LINK_ENTITIES: [&str; 2] = ["operstate", "carrier"];

fn default_entities() -> Vec<String> {
    [
        "operstate",
        "rx_bytes",
        "tx_bytes",
        "rx_throughput",
        "tx_throughput",
    ]
    .iter()
    .map(|e| e.to_string())
    .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct NetConfig {
    #[serde(with = "period_opt")]
    period: Option<Duration>,
    entities: Option<Vec<String>>,
    interfaces: BTreeMap<String, IfaceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct IfaceConfig {
    #[serde(with = "period_opt")]
    period: Option<Duration>,
    entities: Option<Vec<String>>,
    link: SubPeriod,
    stats: SubPeriod,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SubPeriod {
    #[serde(with = "period_opt")]
    period: Option<Duration>,
}

/// A monotonically increasing counter sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Gauge {
    valid: bool,
    value: u64,
}

impl Gauge {
    fn delta(self, new: Gauge) -> u64 {
        if self.valid && new.valid && self.value < new.value {
            new.value - self.value
        } else {
            0
        }
    }

    fn rate(self, new: Gauge, elapsed: Duration) -> f64 {
        self.delta(new) as f64 / elapsed.as_secs_f64()
    }
}

#[derive(Default)]
struct LinkState {
    operstate: String,
    carrier: String,
}

#[derive(Default)]
struct StatsState {
    gauges: BTreeMap<&'static str, Gauge>,
    last: Option<Instant>,
}

struct NetIf {
    name: String,
    link_sensor: Option<PolledSensor>,
    stats_sensor: Option<PolledSensor>,
    link_entities: BTreeSet<String>,
    stats_entities: BTreeSet<String>,
}

impl NetIf {
    fn new(
        name: String,
        link_entities: BTreeSet<String>,
        stats_entities: BTreeSet<String>,
        link_period: Duration,
        stats_period: Duration,
    ) -> Self {
        let link_sensor = (!link_entities.is_empty()).then(|| {
            let state = Arc::new(Mutex::new(LinkState::default()));
            let cell = PubSubCell::new();
            let topic = format!("/{}", name);
            let poller = {
                let name = name.clone();
                let entities = link_entities.clone();
                let state = state.clone();
                let cell = cell.clone();
                let topic = topic.clone();
                Poller::new(link_period, move |forced| {
                    let name = name.clone();
                    let entities = entities.clone();
                    let state = state.clone();
                    let cell = cell.clone();
                    let topic = topic.clone();
                    Box::pin(async move {
                        refresh_link(forced, &name, &entities, &topic, &state, &cell)
                    })
                })
            };
            PolledSensor::new(topic, poller, cell)
        });

        let stats_sensor = (!stats_entities.is_empty()).then(|| {
            let tracked = tracked_gauges(&stats_entities);
            let state = Arc::new(Mutex::new(StatsState {
                gauges: tracked
                    .iter()
                    .map(|gauge| (*gauge, read_gauge(&name, gauge)))
                    .collect(),
                last: None,
            }));
            let cell = PubSubCell::new();
            let topic = format!("/{}/stats", name);
            let poller = {
                let name = name.clone();
                let entities = stats_entities.clone();
                let state = state.clone();
                let cell = cell.clone();
                let topic = topic.clone();
                Poller::new(stats_period, move |_| {
                    let name = name.clone();
                    let entities = entities.clone();
                    let tracked = tracked.clone();
                    let state = state.clone();
                    let cell = cell.clone();
                    let topic = topic.clone();
                    Box::pin(async move {
                        refresh_stats(&name, &entities, &tracked, &topic, &state, &cell)
                    })
                })
            };
            PolledSensor::new(topic, poller, cell)
        });

        Self {
            name,
            link_sensor,
            stats_sensor,
            link_entities,
            stats_entities,
        }
    }

    async fn sync(&self, ps: PubSubHandle) {
        if let Some(sensor) = &self.link_sensor {
            sensor.sync(ps.clone()).await;
        }
        if let Some(sensor) = &self.stats_sensor {
            sensor.sync(ps.clone()).await;
        }
    }

    fn close(&self) {
        if let Some(sensor) = &self.link_sensor {
            sensor.close();
        }
        if let Some(sensor) = &self.stats_sensor {
            sensor.close();
        }
    }

    fn entities(&self) -> Vec<EntityConfig> {
        let mut entities = Vec::new();
        let wireless = self.name.starts_with("wlan");

        if self.link_sensor.is_some() {
            if self.link_entities.contains("operstate") {
                let mut config = entity_map(json!({
                    "name": format!("{{{{node_id}}}} net {}", self.name),
                    "state_topic": format!("~/net/{}", self.name),
                    "value_template": "{{value_json.operstate | is_defined}}",
                    "device_class": "connectivity",
                    "payload_on": "up",
                    "payload_off": "down",
                }));
                if wireless {
                    config.insert("icon".to_string(), json!("mdi:wifi-check"));
                }
                entities.push(EntityConfig::new(
                    format!("{}-operstate", self.name),
                    "binary_sensor",
                    config,
                ));
            }
            if self.link_entities.contains("carrier") {
                let mut config = entity_map(json!({
                    "name": format!("{{{{node_id}}}} net {} carrier", self.name),
                    "state_topic": format!("~/net/{}", self.name),
                    "value_template": "{{value_json.carrier | is_defined}}",
                    "device_class": "connectivity",
                    "payload_on": "1",
                    "payload_off": "0",
                }));
                if wireless {
                    config.insert("icon".to_string(), json!("mdi:wifi"));
                }
                entities.push(EntityConfig::new(
                    format!("{}-carrier", self.name),
                    "binary_sensor",
                    config,
                ));
            }
        }

        for entity in STATS_ENTITIES {
            if !self.stats_entities.contains(entity) {
                continue;
            }
            let mut config = entity_map(json!({
                "name": format!(
                    "{{{{node_id}}}} net {} {}",
                    self.name,
                    entity.replace('_', " ")
                ),
                "state_topic": format!("~/net/{}/stats", self.name),
                "value_template": format!("{{{{value_json.{} | is_defined}}}}", entity),
            }));
            let unit = if entity.ends_with("_bytes") {
                Some("bytes")
            } else if entity.ends_with("_throughput") {
                Some("bps")
            } else if entity.ends_with("_packets") {
                Some("pkts")
            } else if entity.ends_with("_packet_rate") {
                Some("pps")
            } else {
                None
            };
            if let Some(unit) = unit {
                config.insert("unit_of_measurement".to_string(), json!(unit));
            }
            let icon = match (wireless, entity.starts_with("rx_")) {
                (true, true) => "mdi:wifi-arrow-down",
                (true, false) => "mdi:wifi-arrow-up",
                (false, true) => "mdi:download-network-outline",
                (false, false) => "mdi:upload-network-outline",
            };
            config.insert("icon".to_string(), json!(icon));
            entities.push(EntityConfig::new(
                format!("{}-{}", self.name, entity),
                "sensor",
                config,
            ));
        }

        entities
    }
}

/// Composite over all configured interfaces.
struct Nets {
    interfaces: Vec<NetIf>,
}

pub fn new(ctx: &ModuleCtx) -> Result<Box<dyn Module>> {
    let config: NetConfig = ctx.parse("net")?;
    if config.interfaces.is_empty() {
        return Err(Error::Config("net: no interfaces configured".to_string()));
    }
    let module_period = config
        .period
        .or(ctx.default_period())
        .unwrap_or(DEFAULT_PERIOD);
    let module_entities = config.entities.unwrap_or_else(default_entities);

    let mut interfaces = Vec::new();
    for (name, iface) in config.interfaces {
        let entity_names = iface.entities.unwrap_or_else(|| module_entities.clone());
        let (link_entities, stats_entities) = partition_entities(&entity_names);

        let iface_period = iface.period.unwrap_or(module_period);
        let link_period = iface.link.period.unwrap_or(iface_period);
        let stats_period = iface.stats.period.unwrap_or(iface_period);

        interfaces.push(NetIf::new(
            name,
            link_entities,
            stats_entities,
            link_period,
            stats_period,
        ));
    }

    Ok(Box::new(Nets { interfaces }))
}

#[async_trait]
impl Module for Nets {
    async fn sync(&self, ps: PubSubHandle) {
        for iface in &self.interfaces {
            iface.sync(ps.clone()).await;
        }
    }

    async fn close(&self) {
        for iface in &self.interfaces {
            iface.close();
        }
    }

    fn entities(&self) -> Vec<EntityConfig> {
        self.interfaces
            .iter()
            .flat_map(|iface| iface.entities())
            .collect()
    }
}

/// Split configured entity names into link and stats sets; names that
/// match neither are ignored.
fn partition_entities(names: &[String]) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut link = BTreeSet::new();
    let mut stats = BTreeSet::new();
    for name in names {
        if LINK_ENTITIES.contains(&name.as_str()) {
            link.insert(name.clone());
        } else if STATS_ENTITIES.contains(&name.as_str()) {
            stats.insert(name.clone());
        } else {
            tracing::warn!(entity = %name, "unknown net entity");
        }
    }
    (link, stats)
}

/// Counters that must be sampled for the configured stats entities.
fn tracked_gauges(entities: &BTreeSet<String>) -> Vec<&'static str> {
    STATS_GAUGES
        .iter()
        .filter(|gauge| {
            entities.contains(**gauge)
                || STATS_RATES
                    .iter()
                    .any(|r| r.gauge == **gauge && entities.contains(r.rate))
        })
        .copied()
        .collect()
}

fn refresh_link(
    forced: bool,
    name: &str,
    entities: &BTreeSet<String>,
    topic: &str,
    state: &Mutex<LinkState>,
    ps: &PubSubCell,
) {
    let operstate = entities
        .contains("operstate")
        .then(|| read_status(name, "operstate"));
    let carrier = entities
        .contains("carrier")
        .then(|| read_status(name, "carrier"));

    let mut changed = forced;
    let message = {
        let mut state = state.lock().unwrap();
        if let Some(operstate) = operstate {
            if state.operstate != operstate {
                changed = true;
                state.operstate = operstate;
            }
        }
        if let Some(carrier) = carrier {
            if state.carrier != carrier {
                changed = true;
                state.carrier = carrier;
            }
        }

        let mut fields = Map::new();
        if entities.contains("operstate") {
            fields.insert("operstate".to_string(), json!(state.operstate));
        }
        if entities.contains("carrier") {
            fields.insert("carrier".to_string(), json!(state.carrier));
        }
        Value::Object(fields).to_string()
    };

    if changed {
        ps.publish(topic, &message);
    }
}

fn refresh_stats(
    name: &str,
    entities: &BTreeSet<String>,
    tracked: &[&'static str],
    topic: &str,
    state: &Mutex<StatsState>,
    ps: &PubSubCell,
) {
    let now = Instant::now();
    let fresh: BTreeMap<&'static str, Gauge> = tracked
        .iter()
        .map(|gauge| (*gauge, read_gauge(name, gauge)))
        .collect();

    let message = {
        let mut state = state.lock().unwrap();
        let elapsed = state.last.map(|last| now.duration_since(last));
        state.last = Some(now);
        let old = std::mem::replace(&mut state.gauges, fresh);

        let mut fields = Map::new();
        for gauge in STATS_GAUGES {
            if entities.contains(gauge) {
                let sample = state.gauges.get(gauge).copied().unwrap_or_default();
                fields.insert(gauge.to_string(), json!(sample.value));
            }
        }
        for spec in &STATS_RATES {
            if !entities.contains(spec.rate) {
                continue;
            }
            let rate = match elapsed {
                Some(elapsed) if !elapsed.is_zero() => {
                    let previous = old.get(spec.gauge).copied().unwrap_or_default();
                    let current = state.gauges.get(spec.gauge).copied().unwrap_or_default();
                    previous.rate(current, elapsed) * spec.scaling
                }
                _ => 0.0,
            };
            fields.insert(spec.rate.to_string(), json!(round2(rate)));
        }
        Value::Object(fields).to_string()
    };

    ps.publish(topic, &message);
}

fn read_status(name: &str, file: &str) -> String {
    match std::fs::read_to_string(format!("/sys/class/net/{}/{}", name, file)) {
        Ok(content) => content.trim().to_string(),
        Err(_) => "unknown".to_string(),
    }
}

fn read_gauge(name: &str, gauge: &str) -> Gauge {
    let path = format!("/sys/class/net/{}/statistics/{}", name, gauge);
    match std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
    {
        Some(value) => Gauge { valid: true, value },
        None => Gauge::default(),
    }
}
