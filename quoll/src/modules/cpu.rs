//! CPU usage and temperature collector.
//!
//! Reads the aggregate cpu line of `/proc/stat` and derives the idle
//! percentage from counter deltas between refreshes. The temperature is
//! taken from the first thermal zone when it is readable at startup.

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

const STAT_PATH: &str = "/proc/stat";
const TEMP_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";
const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CpuConfig {
    #[serde(with = "period_opt")]
    period: Option<Duration>,
}

/// Counters from the aggregate cpu line of `/proc/stat`:
/// user, nice, system, idle, iowait, irq, softirq, steal, guest, guest_nice.
type CpuStats = [u64; 10];

struct State {
    stats: CpuStats,
    /// Millidegrees, as exposed by the thermal zone.
    temp: u64,
}

struct Cpu {
    sensor: PolledSensor,
    entities: Vec<EntityConfig>,
}

pub fn new(ctx: &ModuleCtx) -> Result<Box<dyn Module>> {
    let config: CpuConfig = ctx.parse("cpu")?;
    let period = config
        .period
        .or(ctx.default_period())
        .unwrap_or(DEFAULT_PERIOD);

    let temp = read_temp();
    let have_temp = temp.is_some();
    let stats = read_stats()
        .map_err(|e| Error::Config(format!("unable to read cpu stats: {}", e)))?;

    let state = Arc::new(Mutex::new(State {
        stats,
        temp: temp.unwrap_or(0),
    }));

    let cell = PubSubCell::new();
    let poller = {
        let state = state.clone();
        let cell = cell.clone();
        Poller::new(period, move |forced| {
            let state = state.clone();
            let cell = cell.clone();
            Box::pin(async move { refresh(forced, have_temp, &state, &cell) })
        })
    };

    Ok(Box::new(Cpu {
        sensor: PolledSensor::new("", poller, cell),
        entities: entities(have_temp),
    }))
}

#[async_trait]
impl Module for Cpu {
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

fn entities(have_temp: bool) -> Vec<EntityConfig> {
    let mut entities = vec![EntityConfig::new(
        "used_percent",
        "sensor",
        entity_map(json!({
            "name": "{{node_id}} CPU used percent",
            "state_topic": "~/cpu",
            "value_template": "{{(100 - value_json.idle_percent) | round(2)}}",
            "unit_of_measurement": "%",
            "icon": "mdi:gauge",
        })),
    )];
    if have_temp {
        entities.push(EntityConfig::new(
            "temperature",
            "sensor",
            entity_map(json!({
                "name": "{{node_id}} CPU temperature",
                "state_topic": "~/cpu",
                "value_template": "{{value_json.temperature}}",
                "device_class": "temperature",
                "unit_of_measurement": "°C",
            })),
        ));
    }
    entities
}

fn refresh(forced: bool, have_temp: bool, state: &Mutex<State>, ps: &PubSubCell) {
    let temp = read_temp();
    let stats = match read_stats() {
        Ok(stats) => stats,
        Err(e) => {
            tracing::warn!(error = %e, "unable to read cpu stats");
            return;
        }
    };

    let mut changed = forced;
    let message = {
        let mut state = state.lock().unwrap();

        if let Some(temp) = temp {
            if temp != state.temp {
                changed = true;
                state.temp = temp;
            }
        }

        let (idle_percent, idle_moved) = idle_percent(&state.stats, &stats);
        if idle_moved {
            changed = true;
        }

        let message = if have_temp {
            json!({
                "idle_percent": idle_percent,
                "temperature": round2(state.temp as f64 / 1000.0),
            })
        } else {
            json!({ "idle_percent": idle_percent })
        }
        .to_string();

        state.stats = stats;
        message
    };

    if changed {
        ps.publish("", &message);
    }
}

/// Idle percentage over the interval between two counter snapshots, and
/// whether the idle counter moved at all.
fn idle_percent(old: &CpuStats, new: &CpuStats) -> (f64, bool) {
    let mut total = 0u64;
    let mut idle = 0u64;
    for (i, (o, n)) in old.iter().zip(new.iter()).enumerate() {
        let delta = n.saturating_sub(*o);
        total += delta;
        if i == 3 {
            idle = delta;
        }
    }
    if total == 0 {
        return (0.0, false);
    }
    (((idle * 10_000) / total) as f64 / 100.0, new[3] != old[3])
}

fn read_stats() -> Result<CpuStats> {
    let content = std::fs::read_to_string(STAT_PATH)?;
    parse_stats(&content)
}

fn parse_stats(content: &str) -> Result<CpuStats> {
    let line = content.lines().next().unwrap_or("");
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.first() != Some(&"cpu") || fields.len() < 8 {
        return Err(Error::Collector(format!("bad cpu line: {}", line)));
    }

    let mut stats = CpuStats::default();
    for (slot, field) in stats.iter_mut().zip(&fields[1..]) {
        *slot = field
            .parse()
            .map_err(|e| Error::Collector(format!("bad cpu counter '{}': {}", field, e)))?;
    }
    Ok(stats)
}

fn read_temp() -> Option<u64> {
    let content = std::fs::read_to_string(TEMP_PATH).ok()?;
    content.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stats() {
        let content = "cpu  1000 20 300 4000 50 6 7 8 0 0\ncpu0 500 10 150 2000 25 3 4 4 0 0\n";
        let stats = parse_stats(content).unwrap();
        assert_eq!(stats, [1000, 20, 300, 4000, 50, 6, 7, 8, 0, 0]);
    }

    #[test]
    fn test_parse_stats_short_line() {
        // fewer counters than we track is fine as long as eight fields exist
        let stats = parse_stats("cpu 1 2 3 4 5 6 7\n");
        assert!(stats.is_err());

        let stats = parse_stats("cpu 1 2 3 4 5 6 7 8\n").unwrap();
        assert_eq!(stats[..8], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(stats[8..], [0, 0]);
    }

    #[test]
    fn test_parse_stats_rejects_garbage() {
        assert!(parse_stats("").is_err());
        assert!(parse_stats("intr 1 2 3 4 5 6 7 8").is_err());
        assert!(parse_stats("cpu 1 2 x 4 5 6 7 8").is_err());
    }

    #[test]
    fn test_idle_percent() {
        let old = [1000, 0, 0, 1000, 0, 0, 0, 0, 0, 0];
        let new = [1500, 0, 0, 1500, 0, 0, 0, 0, 0, 0];
        let (idle, moved) = idle_percent(&old, &new);
        assert_eq!(idle, 50.0);
        assert!(moved);
    }

    #[test]
    fn test_idle_percent_no_elapsed_time() {
        let same = [100, 0, 0, 100, 0, 0, 0, 0, 0, 0];
        let (idle, moved) = idle_percent(&same, &same);
        assert_eq!(idle, 0.0);
        assert!(!moved);
    }

    #[test]
    fn test_idle_percent_fully_busy() {
        let old = [0, 0, 0, 500, 0, 0, 0, 0, 0, 0];
        let new = [1000, 0, 0, 500, 0, 0, 0, 0, 0, 0];
        let (idle, moved) = idle_percent(&old, &new);
        assert_eq!(idle, 0.0);
        assert!(!moved);
    }

    #[test]
    fn test_entities() {
        assert_eq!(entities(false).len(), 1);

        let with_temp = entities(true);
        assert_eq!(with_temp.len(), 2);
        assert_eq!(with_temp[1].name, "temperature");
        assert_eq!(with_temp[1].config["device_class"], "temperature");
    }
}
