//! WAN reachability and public address collector.
//!
//! The link sensor probes a well-known endpoint with a bounded TCP
//! connect; the address sensor asks an HTTPS echo service for the
//! public IP. Probe failures are normal negative results (offline,
//! unknown), never errors.

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

const DEFAULT_LINK_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_IP_PERIOD: Duration = Duration::from_secs(15 * 60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

fn default_probe_address() -> String {
    "1.1.1.1:53".to_string()
}

fn default_ip_url() -> String {
    "https://api.ipify.org".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct WanConfig {
    link: SubPeriod,
    ip: SubPeriod,
    probe_address: String,
    ip_url: String,
}

impl Default for WanConfig {
    fn default() -> Self {
        Self {
            link: SubPeriod::default(),
            ip: SubPeriod::default(),
            probe_address: default_probe_address(),
            ip_url: default_ip_url(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SubPeriod {
    #[serde(with = "period_opt")]
    period: Option<Duration>,
}

#[derive(Default)]
struct WanState {
    online: bool,
    ip: String,
}

struct Wan {
    link_sensor: PolledSensor,
    ip_sensor: PolledSensor,
    ps: PubSubCell,
}

fn online_str(online: bool) -> &'static str {
    if online { "online" } else { "offline" }
}

pub fn new(ctx: &ModuleCtx) -> Result<Box<dyn Module>> {
    let config: WanConfig = ctx.parse("wan")?;
    let link_period = config.link.period.unwrap_or(DEFAULT_LINK_PERIOD);
    let ip_period = config.ip.period.unwrap_or(DEFAULT_IP_PERIOD);

    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| Error::Collector(format!("wan: http client: {}", e)))?;

    let state = Arc::new(Mutex::new(WanState::default()));
    let ps = PubSubCell::new();

    let link_poller = {
        let state = state.clone();
        let ps = ps.clone();
        let address = config.probe_address.clone();
        Poller::new(link_period, move |forced| {
            let state = state.clone();
            let ps = ps.clone();
            let address = address.clone();
            Box::pin(async move {
                let online = check_link(&address).await;
                let changed = {
                    let mut state = state.lock().unwrap();
                    let changed = state.online != online;
                    state.online = online;
                    changed
                };
                if changed || forced {
                    ps.publish("", online_str(online));
                }
            })
        })
    };

    let ip_poller = {
        let state = state.clone();
        let ps = ps.clone();
        let client = client.clone();
        let url = config.ip_url.clone();
        Poller::new(ip_period, move |forced| {
            let state = state.clone();
            let ps = ps.clone();
            let client = client.clone();
            let url = url.clone();
            Box::pin(async move {
                let ip = lookup_ip(&client, &url)
                    .await
                    .unwrap_or_else(|| "unknown".to_string());
                let changed = {
                    let mut state = state.lock().unwrap();
                    let changed = state.ip != ip;
                    state.ip = ip.clone();
                    changed
                };
                if changed || forced {
                    ps.publish("/ip", &ip);
                }
            })
        })
    };

    Ok(Box::new(Wan {
        link_sensor: PolledSensor::new("", link_poller, PubSubCell::new()),
        ip_sensor: PolledSensor::new("/ip", ip_poller, PubSubCell::new()),
        ps,
    }))
}

#[async_trait]
impl Module for Wan {
    async fn sync(&self, ps: PubSubHandle) {
        self.ps.replace(ps.clone());
        self.link_sensor.sync(ps.clone()).await;
        self.ip_sensor.sync(ps).await;
    }

    async fn close(&self) {
        self.link_sensor.close();
        self.ip_sensor.close();
    }

    fn entities(&self) -> Vec<EntityConfig> {
        vec![
            EntityConfig::new(
                "link",
                "binary_sensor",
                entity_map(json!({
                    "name": "WAN",
                    "state_topic": "~/wan",
                    "device_class": "connectivity",
                    "payload_on": "online",
                    "payload_off": "offline",
                })),
            ),
            EntityConfig::new(
                "ip",
                "sensor",
                entity_map(json!({
                    "name": "WAN IP",
                    "state_topic": "~/wan/ip",
                    "availability": [
                        { "topic": "~" },
                        { "topic": "~/wan" },
                    ],
                    "availability_mode": "all",
                })),
            ),
        ]
    }
}

/// Bounded TCP connect to the probe address.
async fn check_link(address: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

/// Public address from the echo endpoint, or None on any failure.
async fn lookup_ip(client: &reqwest::Client, url: &str) -> Option<String> {
    let response = client.get(url).send().await.ok()?;
    let text = response.error_for_status().ok()?.text().await.ok()?;
    let ip = text.trim().to_string();
    (!ip.is_empty()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_str() {
        assert_eq!(online_str(true), "online");
        assert_eq!(online_str(false), "offline");
    }

    #[tokio::test]
    async fn test_entities() {
        let ctx = ModuleCtx::new(json!({}), None);
        let module = new(&ctx).unwrap();
        let entities = module.entities();

        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].name, "link");
        assert_eq!(entities[0].config["payload_on"], "online");
        assert_eq!(entities[1].name, "ip");
        assert_eq!(entities[1].config["availability_mode"], "all");
        assert_eq!(entities[1].config["availability"][1]["topic"], "~/wan");

        module.close().await;
    }

    #[tokio::test]
    async fn test_custom_periods() {
        let ctx = ModuleCtx::new(
            json!({
                "link": { "period": "30s" },
                "ip": { "period": "1h" },
            }),
            None,
        );
        let config: WanConfig = ctx.parse("wan").unwrap();
        assert_eq!(config.link.period, Some(Duration::from_secs(30)));
        assert_eq!(config.ip.period, Some(Duration::from_secs(3600)));
        assert_eq!(config.probe_address, "1.1.1.1:53");
    }

    #[tokio::test]
    async fn test_unresolvable_probe_is_offline() {
        assert!(!check_link("definitely-not-a-host.invalid:53").await);
    }
}
