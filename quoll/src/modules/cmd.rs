//! User-supplied command collector.
//!
//! Each configured binary sensor runs an executable on its own schedule
//! and reports `on` when it exits cleanly. Failures carry the exit code
//! (when it is informative) or the spawn error.

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

const DEFAULT_PERIOD: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CmdConfig {
    #[serde(with = "period_opt")]
    period: Option<Duration>,
    binary_sensors: BTreeMap<String, BinarySensorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct BinarySensorConfig {
    cmd: String,
    #[serde(default, with = "period_opt")]
    period: Option<Duration>,
    #[serde(default, with = "period_opt")]
    timeout: Option<Duration>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    device_class: Option<String>,
    #[serde(default)]
    icon: Option<String>,
}

/// Result of one command run, compared across refreshes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Ok,
    Exit(i32),
    Error(String),
}

#[derive(Default)]
struct CmdState {
    outcome: Option<Outcome>,
    message: String,
}

struct BinarySensorCmd {
    sensor: PolledSensor,
    state: Arc<Mutex<CmdState>>,
    ps: PubSubCell,
    entity: EntityConfig,
}

impl BinarySensorCmd {
    fn new(name: String, config: BinarySensorConfig, default_period: Duration) -> Self {
        let period = config.period.unwrap_or(default_period);
        let display_name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("cmd {}", name));

        let mut entity = entity_map(json!({
            "name": display_name,
            "state_topic": format!("~/cmd/{}", name),
            "value_template": "{{value_json.state}}",
            "payload_on": "on",
            "payload_off": "off",
        }));
        if let Some(device_class) = &config.device_class {
            entity.insert("device_class".to_string(), json!(device_class));
        }
        if let Some(icon) = &config.icon {
            entity.insert("icon".to_string(), json!(icon));
        }

        let state = Arc::new(Mutex::new(CmdState::default()));
        let cell = PubSubCell::new();
        let topic = format!("/{}", name);

        let poller = {
            let state = state.clone();
            let cell = cell.clone();
            let topic = topic.clone();
            let command = config.cmd.clone();
            let timeout = config.timeout;
            Poller::new(period, move |forced| {
                let state = state.clone();
                let cell = cell.clone();
                let topic = topic.clone();
                let command = command.clone();
                Box::pin(async move {
                    refresh(forced, &command, timeout, &topic, &state, &cell).await
                })
            })
        };

        Self {
            sensor: PolledSensor::new(topic, poller, cell.clone()),
            state,
            ps: cell,
            entity: EntityConfig::new(name, "binary_sensor", entity),
        }
    }

    fn publish(&self) {
        let message = self.state.lock().unwrap().message.clone();
        if !message.is_empty() {
            self.ps.publish(self.sensor.topic(), &message);
        }
    }
}

/// Composite over all configured command sensors.
struct Cmds {
    commands: Vec<BinarySensorCmd>,
}

pub fn new(ctx: &ModuleCtx) -> Result<Box<dyn Module>> {
    let config: CmdConfig = ctx.parse("cmd")?;
    if config.binary_sensors.is_empty() {
        return Err(Error::Config("cmd: no binary_sensors configured".to_string()));
    }
    let default_period = config
        .period
        .or(ctx.default_period())
        .unwrap_or(DEFAULT_PERIOD);

    let commands = config
        .binary_sensors
        .into_iter()
        .map(|(name, sensor)| BinarySensorCmd::new(name, sensor, default_period))
        .collect();

    Ok(Box::new(Cmds { commands }))
}

#[async_trait]
impl Module for Cmds {
    async fn sync(&self, ps: PubSubHandle) {
        for command in &self.commands {
            command.sensor.sync(ps.clone()).await;
        }
    }

    async fn close(&self) {
        for command in &self.commands {
            command.sensor.close();
        }
    }

    fn publish(&self) {
        for command in &self.commands {
            command.publish();
        }
    }

    fn entities(&self) -> Vec<EntityConfig> {
        self.commands
            .iter()
            .map(|command| command.entity.clone())
            .collect()
    }
}

async fn refresh(
    forced: bool,
    command: &str,
    timeout: Option<Duration>,
    topic: &str,
    state: &Mutex<CmdState>,
    ps: &PubSubCell,
) {
    let outcome = run_command(command, timeout).await;

    let message = {
        let mut state = state.lock().unwrap();
        if state.outcome.as_ref() == Some(&outcome) && !forced {
            return;
        }
        state.outcome = Some(outcome.clone());
        let message = render(&outcome);
        state.message = message.clone();
        message
    };

    ps.publish(topic, &message);
}

async fn run_command(command: &str, timeout: Option<Duration>) -> Outcome {
    let status = match timeout {
        Some(timeout) => {
            match tokio::time::timeout(timeout, tokio::process::Command::new(command).status())
                .await
            {
                Ok(status) => status,
                Err(_) => return Outcome::Error("timeout".to_string()),
            }
        }
        None => tokio::process::Command::new(command).status().await,
    };

    match status {
        Ok(status) if status.success() => Outcome::Ok,
        Ok(status) => Outcome::Exit(status.code().unwrap_or(-1)),
        Err(e) => Outcome::Error(e.to_string()),
    }
}

fn render(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Ok => json!({ "state": "on" }),
        // exit code 1 is the conventional plain "off"
        Outcome::Exit(1) => json!({ "state": "off" }),
        Outcome::Exit(code) => json!({ "state": "off", "exit_code": code.to_string() }),
        Outcome::Error(error) => json!({ "state": "off", "error": error }),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        assert_eq!(render(&Outcome::Ok), r#"{"state":"on"}"#);
        assert_eq!(render(&Outcome::Exit(1)), r#"{"state":"off"}"#);
        assert_eq!(
            render(&Outcome::Exit(3)),
            r#"{"exit_code":"3","state":"off"}"#
        );
        assert_eq!(
            render(&Outcome::Error("timeout".to_string())),
            r#"{"error":"timeout","state":"off"}"#
        );
    }

    #[tokio::test]
    async fn test_run_command_success() {
        assert_eq!(run_command("true", None).await, Outcome::Ok);
    }

    #[tokio::test]
    async fn test_run_command_failure() {
        assert_eq!(run_command("false", None).await, Outcome::Exit(1));
    }

    #[tokio::test]
    async fn test_run_command_missing() {
        assert!(matches!(
            run_command("/no/such/binary", None).await,
            Outcome::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_no_sensors_is_config_error() {
        let ctx = ModuleCtx::new(json!({}), None);
        assert!(new(&ctx).is_err());
    }

    #[tokio::test]
    async fn test_entity_shape() {
        let ctx = ModuleCtx::new(
            json!({
                "binary_sensors": {
                    "backup": {
                        "cmd": "/usr/local/bin/backup-fresh",
                        "name": "Backup fresh",
                        "device_class": "problem",
                        "timeout": "30s",
                    },
                },
            }),
            None,
        );
        let module = new(&ctx).unwrap();
        let entities = module.entities();

        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "backup");
        assert_eq!(entities[0].class, "binary_sensor");
        assert_eq!(entities[0].config["name"], "Backup fresh");
        assert_eq!(entities[0].config["state_topic"], "~/cmd/backup");
        assert_eq!(entities[0].config["device_class"], "problem");

        module.close().await;
    }
}
