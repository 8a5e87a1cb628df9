//! Module capabilities, the factory registry, and the dispatcher.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::pubsub::PubSubHandle;
use crate::transport::Transport;

/// Discovery descriptor for one entity of a module.
///
/// The config map holds the entity-specific announcement fields; the
/// announcer completes it with identity defaults before publication.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityConfig {
    /// Entity name, unique within its module.
    pub name: String,
    /// Entity class consumed by the discovery protocol, e.g. "sensor".
    pub class: String,
    /// Entity-specific announcement fields.
    pub config: serde_json::Map<String, Value>,
}

impl EntityConfig {
    pub fn new(
        name: impl Into<String>,
        class: impl Into<String>,
        config: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            config,
        }
    }
}

/// A sensor module hosted by the daemon.
///
/// `sync` and `close` are required. Modules with discoverable entities
/// override `entities`; modules that can republish their last state
/// without recomputation override `publish`. Composite modules fan every
/// call out to their children.
#[async_trait]
pub trait Module: Send + Sync {
    /// Rebind to a pub/sub handle and republish current state.
    async fn sync(&self, ps: PubSubHandle);

    /// Release resources. Called exactly once at shutdown.
    async fn close(&self);

    /// Republish the last known state without recomputation.
    fn publish(&self) {}

    /// Discovery descriptors, fixed after construction.
    fn entities(&self) -> Vec<EntityConfig> {
        Vec::new()
    }
}

/// Configuration handed to a module factory: the module's raw config
/// section plus daemon-level defaults.
#[derive(Debug, Clone)]
pub struct ModuleCtx {
    raw: Value,
    default_period: Option<Duration>,
}

impl ModuleCtx {
    pub fn new(raw: Value, default_period: Option<Duration>) -> Self {
        Self {
            raw,
            default_period,
        }
    }

    /// Deserialize the module's config section into its typed form.
    pub fn parse<T: DeserializeOwned>(&self, module: &str) -> Result<T> {
        serde_json::from_value(self.raw.clone())
            .map_err(|e| Error::Config(format!("bad {} config: {}", module, e)))
    }

    /// The daemon-level default period, if configured.
    pub fn default_period(&self) -> Option<Duration> {
        self.default_period
    }
}

/// Builds a module from its configuration section.
pub type ModuleFactory = fn(&ModuleCtx) -> Result<Box<dyn Module>>;

/// Explicit factory registry, built at startup before configuration is
/// processed.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: BTreeMap<&'static str, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its configuration name.
    pub fn register(&mut self, name: &'static str, factory: ModuleFactory) {
        self.factories.insert(name, factory);
    }

    /// Instantiate a configured module. An unrecognized name is a fatal
    /// configuration error.
    pub fn build(&self, name: &str, ctx: &ModuleCtx) -> Result<Box<dyn Module>> {
        match self.factories.get(name) {
            Some(factory) => factory(ctx),
            None => Err(Error::Config(format!("unsupported module: {}", name))),
        }
    }
}

/// Holds the built modules and fans lifecycle calls out to them.
///
/// Built once at startup and only iterated afterwards; the daemon-status
/// entry uses the empty name and binds to the base topic unscoped.
pub struct Dispatcher {
    modules: Vec<(String, Box<dyn Module>)>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Add a module under its configured name.
    pub fn add(&mut self, name: impl Into<String>, module: Box<dyn Module>) {
        self.modules.push((name.into(), module));
    }

    /// Rebind every module to the (re)connected transport.
    pub async fn sync_all(&self, transport: &Transport, base_topic: &str) {
        for (name, module) in &self.modules {
            let topic = if name.is_empty() {
                base_topic.to_string()
            } else {
                format!("{}/{}", base_topic, name)
            };
            module.sync(transport.scoped(&topic)).await;
        }
    }

    /// Republish every module's last known state.
    pub fn publish_all(&self) {
        for (_, module) in &self.modules {
            module.publish();
        }
    }

    /// Aggregated discovery descriptors, keyed by module name.
    pub fn entities(&self) -> Vec<(String, Vec<EntityConfig>)> {
        self.modules
            .iter()
            .map(|(name, module)| (name.clone(), module.entities()))
            .collect()
    }

    /// Close every module exactly once, in registration order.
    pub async fn close_all(&self) {
        for (name, module) in &self.modules {
            tracing::debug!(module = %name, "closing module");
            module.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestModule {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Module for TestModule {
        async fn sync(&self, _ps: PubSubHandle) {}

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn entities(&self) -> Vec<EntityConfig> {
            vec![EntityConfig::new("state", "sensor", serde_json::Map::new())]
        }
    }

    fn test_factory(_ctx: &ModuleCtx) -> Result<Box<dyn Module>> {
        Ok(Box::new(TestModule {
            closes: Arc::new(AtomicUsize::new(0)),
        }))
    }

    #[test]
    fn test_registry_unknown_module() {
        let registry = ModuleRegistry::new();
        let ctx = ModuleCtx::new(json!({}), None);
        let err = registry.build("nope", &ctx).err().unwrap();
        assert!(err.to_string().contains("unsupported module: nope"));
    }

    #[test]
    fn test_registry_builds_registered_module() {
        let mut registry = ModuleRegistry::new();
        registry.register("test", test_factory);
        let ctx = ModuleCtx::new(json!({}), None);
        let module = registry.build("test", &ctx).unwrap();
        assert_eq!(module.entities().len(), 1);
    }

    #[test]
    fn test_ctx_parse() {
        #[derive(Debug, Default, Deserialize)]
        #[serde(default)]
        struct Probe {
            path: String,
        }

        let ctx = ModuleCtx::new(json!({ "path": "/home" }), None);
        let probe: Probe = ctx.parse("probe").unwrap();
        assert_eq!(probe.path, "/home");

        let ctx = ModuleCtx::new(json!({ "path": 7 }), None);
        assert!(ctx.parse::<Probe>("probe").is_err());
    }

    #[tokio::test]
    async fn test_dispatcher_fan_out() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.add(
            "",
            Box::new(TestModule {
                closes: closes.clone(),
            }),
        );
        dispatcher.add(
            "cpu",
            Box::new(TestModule {
                closes: closes.clone(),
            }),
        );

        let entities = dispatcher.entities();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].0, "");
        assert_eq!(entities[1].0, "cpu");

        dispatcher.publish_all();
        dispatcher.close_all().await;
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }
}
