//! Quoll core library
//!
//! Building blocks for the quoll host-monitoring daemon:
//!
//! - [`poller`] - per-sensor refresh scheduling (periodic, on demand, forced)
//! - [`pubsub`] - the publish/subscribe contract and the stub binding
//! - [`module`] - module capabilities, factory registry, and dispatcher
//! - [`discovery`] - entity announcements for the auto-discovery consumer
//! - [`transport`] - the Zenoh-backed transport adapter
//! - [`config`] - configuration loading (JSON5) and duration helpers
//! - [`error`] - error types

pub mod config;
pub mod discovery;
pub mod error;
pub mod module;
pub mod poller;
pub mod pubsub;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types at the crate root
pub use config::{
    LogFormat, LoggingConfig, TransportConfig, format_period, load_config, parse_config,
    parse_period,
};
pub use discovery::{Announcer, DiscoveryConfig, NODE_ID_TOKEN};
pub use error::{Error, Result};
pub use module::{Dispatcher, EntityConfig, Module, ModuleCtx, ModuleFactory, ModuleRegistry};
pub use poller::{PolledSensor, Poller, RefreshFuture};
pub use pubsub::{Handler, PubSub, PubSubCell, PubSubHandle, StubPubSub, stub};
pub use transport::{Connected, SubscriptionGuard, Transport};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
