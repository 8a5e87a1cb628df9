//! Memory and swap usage collector, fed from `/proc/meminfo`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use quoll_core::config::period_opt;
use quoll_core::{
    EntityConfig, Error, Module, ModuleCtx, PolledSensor, Poller, PubSubCell, PubSubHandle, Result,
};

use super::entity_map;

const MEMINFO_PATH: &str = "/proc/meminfo";
const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct MemConfig {
    #[serde(with = "period_opt")]
    period: Option<Duration>,
    entities: Vec<String>,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            period: None,
            entities: vec![
                "ram_used_percent".to_string(),
                "swap_used_percent".to_string(),
            ],
        }
    }
}

type MemStats = BTreeMap<String, f64>;

struct Mem {
    sensor: PolledSensor,
    entities: Vec<EntityConfig>,
}

pub fn new(ctx: &ModuleCtx) -> Result<Box<dyn Module>> {
    let config: MemConfig = ctx.parse("mem")?;
    let period = config
        .period
        .or(ctx.default_period())
        .unwrap_or(DEFAULT_PERIOD);

    let initial = read_stats(&config.entities)
        .map_err(|e| Error::Config(format!("unable to read mem stats: {}", e)))?;
    let module_entities = entities(&initial);

    let state = Arc::new(Mutex::new(initial));
    let cell = PubSubCell::new();
    let poller = {
        let state = state.clone();
        let cell = cell.clone();
        let fields = config.entities.clone();
        Poller::new(period, move |forced| {
            let state = state.clone();
            let cell = cell.clone();
            let fields = fields.clone();
            Box::pin(async move { refresh(forced, &fields, &state, &cell) })
        })
    };

    Ok(Box::new(Mem {
        sensor: PolledSensor::new("", poller, cell),
        entities: module_entities,
    }))
}

#[async_trait]
impl Module for Mem {
    async fn sync(&self, ps: PubSubHandle) {
        self.sensor.sync(ps).await;
    }

    async fn close(&self) {
        self.sensor.close();
    }

    fn entities(&self) -> Vec<EntityConfig> {
        self.entities.clone()
    }
}

fn entities(stats: &MemStats) -> Vec<EntityConfig> {
    let mut entities = Vec::new();
    if stats.contains_key("ram_used_percent") {
        entities.push(EntityConfig::new(
            "ram_used_percent",
            "sensor",
            entity_map(json!({
                "name": "{{node_id}} RAM used percent",
                "state_topic": "~/mem",
                "value_template": "{{value_json.ram_used_percent}}",
                "unit_of_measurement": "%",
                "icon": "mdi:gauge",
            })),
        ));
    }
    if stats.contains_key("swap_used_percent") {
        entities.push(EntityConfig::new(
            "swap_used_percent",
            "sensor",
            entity_map(json!({
                "name": "{{node_id}} swap used percent",
                "state_topic": "~/mem",
                "value_template": "{{value_json.swap_used_percent}}",
                "unit_of_measurement": "%",
                "icon": "mdi:gauge",
            })),
        ));
    }
    entities
}

fn refresh(forced: bool, fields: &[String], state: &Mutex<MemStats>, ps: &PubSubCell) {
    let stats = match read_stats(fields) {
        Ok(stats) => stats,
        Err(e) => {
            tracing::warn!(error = %e, "unable to read mem stats");
            return;
        }
    };

    let mut changed = forced;
    let message = {
        let mut state = state.lock().unwrap();
        let keys: Vec<String> = state.keys().cloned().collect();
        for key in keys {
            let new = stats.get(&key).copied().unwrap_or(0.0);
            if state[&key] != new {
                changed = true;
                state.insert(key, new);
            }
        }
        json!(*state).to_string()
    };

    if changed {
        ps.publish("", &message);
    }
}

fn read_stats(fields: &[String]) -> Result<MemStats> {
    let content = std::fs::read_to_string(MEMINFO_PATH)?;
    Ok(parse_meminfo(&content, fields))
}

/// Used-percent figures derived from the meminfo counters, limited to
/// the requested fields. Percentages carry two decimals.
fn parse_meminfo(content: &str, fields: &[String]) -> MemStats {
    const NAMES: [&str; 4] = ["MemTotal:", "MemAvailable:", "SwapTotal:", "SwapFree:"];
    let mut counters = [0u64; 4];

    for line in content.lines() {
        for (i, name) in NAMES.iter().enumerate() {
            if let Some(rest) = line.strip_prefix(name) {
                if let Some(value) = rest.split_whitespace().next() {
                    if let Ok(value) = value.parse() {
                        counters[i] = value;
                    }
                }
            }
        }
    }

    let [total, available, swap_total, swap_free] = counters;
    let mut stats = MemStats::new();
    for field in fields {
        if field == "ram_used_percent" && total != 0 && available != 0 {
            stats.insert(
                field.clone(),
                (((total - available) * 10_000) / total) as f64 / 100.0,
            );
        }
        if field == "swap_used_percent" && swap_total != 0 {
            stats.insert(
                field.clone(),
                (((swap_total - swap_free) * 10_000) / swap_total) as f64 / 100.0,
            );
        }
    }
    stats
}
