//! System identity collector: kernel and OS release, pending updates.
//!
//! Values come from `uname`, `/etc/os-release`, and the package manager
//! status helpers. The message is republished only when its rendered
//! form changes, so the long default period costs nothing when idle.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use quoll_core::config::period_opt;
use quoll_core::{
    EntityConfig, Module, ModuleCtx, PolledSensor, Poller, PubSubCell, PubSubHandle, Result,
};

use super::entity_map;

const OS_RELEASE_PATH: &str = "/etc/os-release";
const DEFAULT_PERIOD: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SysInfoConfig {
    #[serde(with = "period_opt")]
    period: Option<Duration>,
    entities: Vec<String>,
}

impl Default for SysInfoConfig {
    fn default() -> Self {
        Self {
            period: None,
            entities: vec!["kernel_release".to_string(), "os_release".to_string()],
        }
    }
}

/// Consumer-facing display name for an entity.
fn display_name(entity: &str) -> &'static str {
    match entity {
        "machine" => "Machine",
        "kernel_name" => "Kernel name",
        "kernel_release" => "Kernel release",
        "kernel_version" => "Kernel version",
        "os_release" => "OS release",
        "os_name" => "OS name",
        "os_version" => "OS version",
        "apt_status" => "APT status",
        "apt_upgradable" => "APT upgradable",
        "pacman_status" => "Pacman status",
        _ => "Unknown",
    }
}

/// os-release field backing an entity.
fn os_release_field(entity: &str) -> Option<&'static str> {
    match entity {
        "os_release" => Some("PRETTY_NAME"),
        "os_name" => Some("NAME"),
        "os_version" => Some("VERSION"),
        _ => None,
    }
}

/// uname option generating an entity.
fn uname_flag(entity: &str) -> Option<&'static str> {
    match entity {
        "machine" => Some("-m"),
        "kernel_name" => Some("-s"),
        "kernel_release" => Some("-r"),
        "kernel_version" => Some("-v"),
        _ => None,
    }
}

struct SysInfo {
    sensor: PolledSensor,
    ps: PubSubCell,
    state: Arc<Mutex<String>>,
    entities: Vec<String>,
}

pub fn new(ctx: &ModuleCtx) -> Result<Box<dyn Module>> {
    let config: SysInfoConfig = ctx.parse("sys_info")?;
    let period = config
        .period
        .or(ctx.default_period())
        .unwrap_or(DEFAULT_PERIOD);
    let mut entities = config.entities;
    entities.sort();

    let state = Arc::new(Mutex::new(String::new()));
    let cell = PubSubCell::new();
    let poller = {
        let entities = entities.clone();
        let state = state.clone();
        let cell = cell.clone();
        Poller::new(period, move |_| {
            let entities = entities.clone();
            let state = state.clone();
            let cell = cell.clone();
            Box::pin(async move { refresh(&entities, &state, &cell).await })
        })
    };

    Ok(Box::new(SysInfo {
        sensor: PolledSensor::new("", poller, cell.clone()),
        ps: cell,
        state,
        entities,
    }))
}

#[async_trait]
impl Module for SysInfo {
    async fn sync(&self, ps: PubSubHandle) {
        self.sensor.sync(ps).await;
    }

    async fn close(&self) {
        self.sensor.close();
    }

    fn publish(&self) {
        let message = self.state.lock().unwrap().clone();
        if !message.is_empty() {
            self.ps.publish("", &message);
        }
    }

    fn entities(&self) -> Vec<EntityConfig> {
        self.entities
            .iter()
            .map(|entity| {
                let mut config = entity_map(json!({
                    "name": display_name(entity),
                    "state_topic": "~/sys_info",
                    "value_template": format!("{{{{value_json.{}}}}}", entity),
                }));
                match entity.as_str() {
                    "apt_upgradable" => {
                        config.insert("unit_of_measurement".to_string(), json!("packages"));
                        config.insert("icon".to_string(), json!("mdi:package-down"));
                    }
                    "apt_status" | "pacman_status" => {
                        config.insert("device_class".to_string(), json!("update"));
                        config.insert("payload_on".to_string(), json!("true"));
                        config.insert("payload_off".to_string(), json!("false"));
                    }
                    _ => {
                        config.insert("icon".to_string(), json!("mdi:information-outline"));
                    }
                }
                let class = if entity == "apt_status" || entity == "pacman_status" {
                    "binary_sensor"
                } else {
                    "sensor"
                };
                EntityConfig::new(entity.clone(), class, config)
            })
            .collect()
    }
}

async fn refresh(entities: &[String], state: &Mutex<String>, ps: &PubSubCell) {
    let mut os_release: Option<BTreeMap<String, String>> = None;
    let mut upgradable: Option<Option<usize>> = None;

    let mut fields = BTreeMap::new();
    for entity in entities {
        if let Some(field) = os_release_field(entity) {
            let info = os_release.get_or_insert_with(|| read_os_release().unwrap_or_default());
            if !info.is_empty() {
                fields.insert(
                    entity.clone(),
                    info.get(field).cloned().unwrap_or_default(),
                );
            }
            continue;
        }
        if let Some(flag) = uname_flag(entity) {
            if let Some(value) = uname(flag).await {
                fields.insert(entity.clone(), value);
            }
            continue;
        }
        if entity == "pacman_status" {
            let status = if pacman_check_updates().await == 2 {
                "false"
            } else {
                "true"
            };
            fields.insert(entity.clone(), status.to_string());
            continue;
        }
        // apt entities share one package list query
        let count = match upgradable {
            Some(count) => count,
            None => {
                let fetched = apt_upgradable().await;
                upgradable = Some(fetched);
                fetched
            }
        };
        if entity == "apt_status" {
            if let Some(count) = count {
                fields.insert(
                    entity.clone(),
                    if count == 0 { "false" } else { "true" }.to_string(),
                );
            }
        } else if entity == "apt_upgradable" {
            if let Some(count) = count {
                fields.insert(entity.clone(), count.to_string());
            }
        }
    }

    let message = json!(fields).to_string();
    let changed = {
        let mut state = state.lock().unwrap();
        if *state != message {
            *state = message.clone();
            true
        } else {
            false
        }
    };
    if changed {
        ps.publish("", &message);
    }
}

fn read_os_release() -> Option<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(OS_RELEASE_PATH).ok()?;
    Some(parse_os_release(&content))
}

fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    let mut info = BTreeMap::new();
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            info.insert(key.to_string(), unquote(value.trim()).to_string());
        }
    }
    info
}

fn unquote(s: &str) -> &str {
    let s = s.strip_prefix('"').unwrap_or(s);
    s.strip_suffix('"').unwrap_or(s)
}

async fn uname(flag: &str) -> Option<String> {
    let output = tokio::process::Command::new("uname")
        .arg(flag)
        .output()
        .await
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Count of packages apt reports as upgradable, or None when the query
/// fails (no apt on this host).
async fn apt_upgradable() -> Option<usize> {
    let output = tokio::process::Command::new("apt")
        .args(["-qq", "list", "--upgradable"])
        .output()
        .await
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).lines().count())
}

/// checkupdates exit code; 2 means no pending updates.
async fn pacman_check_updates() -> i32 {
    match tokio::process::Command::new("checkupdates").status().await {
        Ok(status) => status.code().unwrap_or(1),
        Err(_) => 1,
    }
}
