//! Daemon configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use quoll_core::config::period_opt;
use quoll_core::{DiscoveryConfig, LoggingConfig, ModuleCtx, TransportConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Zenoh connection settings.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Base topic for all published state. Defaults to `quoll/<hostname>`.
    #[serde(default)]
    pub base_topic: Option<String>,

    /// Default polling period inherited by modules that do not set one.
    #[serde(default, with = "period_opt")]
    pub period: Option<Duration>,

    /// Modules to activate.
    pub modules: Vec<String>,

    /// Discovery announcement settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-module configuration sections, keyed by module name.
    #[serde(flatten)]
    pub sections: BTreeMap<String, Value>,
}

impl DaemonConfig {
    /// Load and validate a JSON5 configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modules.is_empty() {
            return Err(ConfigError::Validation(
                "at least one module must be configured".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for name in &self.modules {
            if !seen.insert(name) {
                return Err(ConfigError::Validation(format!(
                    "module '{}' listed more than once",
                    name
                )));
            }
        }
        Ok(())
    }

    /// The base topic, defaulting to `quoll/<hostname>`.
    pub fn base_topic(&self) -> String {
        self.base_topic
            .clone()
            .unwrap_or_else(|| format!("quoll/{}", local_hostname()))
    }

    /// The node identifier used for discovery, defaulting to the hostname.
    pub fn node_id(&self) -> String {
        self.discovery
            .node_id
            .clone()
            .unwrap_or_else(local_hostname)
    }

    /// The configuration context for a module's section.
    pub fn module_ctx(&self, name: &str) -> ModuleCtx {
        let raw = self
            .sections
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        ModuleCtx::new(raw, self.period)
    }
}

/// Local hostname, or "unknown" when it cannot be determined.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let json = r#"{
            modules: ["cpu", "mem"],
        }"#;

        let config: DaemonConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.transport.mode, "peer");
        assert_eq!(config.modules, vec!["cpu", "mem"]);
        assert_eq!(config.period, None);
        assert!(config.discovery.prefix.is_none());
        assert!(config.sections.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            transport: {
                mode: "client",
                connect: ["tcp/broker.local:7447"],
            },
            base_topic: "quoll/den-pi",
            period: "30s",
            modules: ["cpu", "fs"],
            discovery: {
                prefix: "discover",
                node_id: "den-pi",
                trigger_topic: "discover/status",
                settle_delay: "5s",
            },
            logging: { level: "debug" },
            cpu: { period: "10s" },
            fs: {
                mountpoints: {
                    root: { path: "/" },
                },
            },
        }"#;

        let config: DaemonConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.base_topic(), "quoll/den-pi");
        assert_eq!(config.period, Some(Duration::from_secs(30)));
        assert_eq!(config.node_id(), "den-pi");
        assert_eq!(
            config.discovery.settle_delay,
            Duration::from_secs(5)
        );
        assert_eq!(config.logging.level, "debug");

        let cpu = config.module_ctx("cpu");
        assert_eq!(cpu.default_period(), Some(Duration::from_secs(30)));

        assert!(config.sections.contains_key("fs"));
        assert!(!config.sections.contains_key("net"));
    }

    #[test]
    fn test_validate_no_modules() {
        let config: DaemonConfig = json5::from_str(r#"{ modules: [] }"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_module() {
        let config: DaemonConfig = json5::from_str(r#"{ modules: ["cpu", "cpu"] }"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_section_yields_empty_ctx() {
        let config: DaemonConfig = json5::from_str(r#"{ modules: ["cpu"] }"#).unwrap();
        let ctx = config.module_ctx("cpu");
        assert_eq!(ctx.default_period(), None);
    }
}
