//! Filesystem usage collector.
//!
//! One polled sensor per configured mountpoint, fed by `df`. A mount
//! that disappears is reported as unmounted rather than as an error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use quoll_core::config::period_opt;
use quoll_core::{
    EntityConfig, Error, Module, ModuleCtx, PolledSensor, Poller, PubSubCell, PubSubHandle, Result,
};

use super::{entity_map, round2};

const DEFAULT_PERIOD: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FsConfig {
    #[serde(with = "period_opt")]
    period: Option<Duration>,
    mountpoints: std::collections::BTreeMap<String, MountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct MountConfig {
    path: String,
    #[serde(default, with = "period_opt")]
    period: Option<Duration>,
}

#[derive(Default)]
struct MountState {
    mounted: bool,
    /// Used space in basis points of the total.
    used: u32,
    message: String,
}

/// A single monitored mountpoint.
struct Mount {
    name: String,
    sensor: PolledSensor,
    state: Arc<Mutex<MountState>>,
    ps: PubSubCell,
}

impl Mount {
    fn new(name: String, path: String, period: Duration) -> Self {
        let state = Arc::new(Mutex::new(MountState::default()));
        let cell = PubSubCell::new();
        let topic = format!("/{}", name);

        let poller = {
            let state = state.clone();
            let cell = cell.clone();
            let topic = topic.clone();
            Poller::new(period, move |forced| {
                let path = path.clone();
                let state = state.clone();
                let cell = cell.clone();
                let topic = topic.clone();
                Box::pin(async move { refresh(forced, &path, &topic, &state, &cell).await })
            })
        };

        Self {
            name,
            sensor: PolledSensor::new(topic, poller, cell.clone()),
            state,
            ps: cell,
        }
    }

    fn publish(&self) {
        let message = self.state.lock().unwrap().message.clone();
        if !message.is_empty() {
            self.ps.publish(self.sensor.topic(), &message);
        }
    }

    fn entities(&self) -> Vec<EntityConfig> {
        let state_topic = format!("~/fs/{}", self.name);
        vec![
            EntityConfig::new(
                self.name.clone(),
                "binary_sensor",
                entity_map(json!({
                    "name": format!("{{{{node_id}}}} fs {}", self.name),
                    "state_topic": state_topic,
                    "value_template": "{{value_json.mounted | is_defined}}",
                    "device_class": "connectivity",
                    "icon": "mdi:harddisk",
                    "payload_on": "on",
                    "payload_off": "off",
                })),
            ),
            EntityConfig::new(
                format!("{}_used_percent", self.name),
                "sensor",
                entity_map(json!({
                    "name": format!("{{{{node_id}}}} fs {} used percent", self.name),
                    "state_topic": state_topic,
                    "value_template": "{{(value_json.used_percent) | round(2)}}",
                    "unit_of_measurement": "%",
                    "icon": "mdi:gauge",
                    "availability": [
                        { "topic": "~" },
                        {
                            "topic": state_topic,
                            "value_template": "{{value_json.mounted | is_defined | default('off')}}",
                            "payload_available": "on",
                            "payload_not_available": "off",
                        },
                    ],
                })),
            ),
        ]
    }
}

/// Composite over all configured mountpoints.
struct Mounts {
    mounts: Vec<Mount>,
}

pub fn new(ctx: &ModuleCtx) -> Result<Box<dyn Module>> {
    let config: FsConfig = ctx.parse("fs")?;
    if config.mountpoints.is_empty() {
        return Err(Error::Config("fs: no mountpoints configured".to_string()));
    }
    let module_period = config
        .period
        .or(ctx.default_period())
        .unwrap_or(DEFAULT_PERIOD);

    let mounts = config
        .mountpoints
        .into_iter()
        .map(|(name, mount)| {
            let period = mount.period.unwrap_or(module_period);
            Mount::new(name, mount.path, period)
        })
        .collect();

    Ok(Box::new(Mounts { mounts }))
}

#[async_trait]
impl Module for Mounts {
    async fn sync(&self, ps: PubSubHandle) {
        for mount in &self.mounts {
            mount.sensor.sync(ps.clone()).await;
        }
    }

    async fn close(&self) {
        for mount in &self.mounts {
            mount.sensor.close();
        }
    }

    fn publish(&self) {
        for mount in &self.mounts {
            mount.publish();
        }
    }

    fn entities(&self) -> Vec<EntityConfig> {
        self.mounts
            .iter()
            .flat_map(|mount| mount.entities())
            .collect()
    }
}

async fn refresh(forced: bool, path: &str, topic: &str, state: &Mutex<MountState>, ps: &PubSubCell) {
    let sample = sample_mount(path).await;

    let mut state = state.lock().unwrap();
    let mut changed = forced;

    match sample {
        Ok(sample) => {
            if let Some((total, used)) = sample {
                if total == 0 {
                    tracing::warn!(path = %path, "df reported zero total size");
                    return;
                }
                let used_bp = ((used * 10_000) / total) as u32;
                if used_bp != state.used {
                    state.used = used_bp;
                    changed = true;
                }
                if !state.mounted {
                    state.mounted = true;
                    changed = true;
                }
            } else if state.mounted {
                state.mounted = false;
                changed = true;
            }
        }
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "error reading df");
            return;
        }
    }

    if changed {
        let message = if state.mounted {
            json!({
                "mounted": "on",
                "used_percent": round2(state.used as f64 / 100.0),
            })
        } else {
            json!({ "mounted": "off" })
        }
        .to_string();
        state.message = message.clone();
        ps.publish(topic, &message);
    }
}

/// (total, used) blocks for the mount, or None when not mounted.
async fn sample_mount(path: &str) -> Result<Option<(u64, u64)>> {
    let output = match tokio::process::Command::new("df").arg(path).output().await {
        Ok(output) if output.status.success() => output,
        // df exits non-zero for unknown paths; treat as unmounted
        Ok(_) => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    parse_df(&String::from_utf8_lossy(&output.stdout), path)
}

fn parse_df(output: &str, path: &str) -> Result<Option<(u64, u64)>> {
    let Some(line) = output.lines().nth(1) else {
        return Err(Error::Collector("missing df data line".to_string()));
    };
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 || fields[5] != path {
        return Ok(None);
    }
    let total = fields[1]
        .parse()
        .map_err(|e| Error::Collector(format!("bad df total '{}': {}", fields[1], e)))?;
    let used = fields[2]
        .parse()
        .map_err(|e| Error::Collector(format!("bad df used '{}': {}", fields[2], e)))?;
    Ok(Some((total, used)))
}
