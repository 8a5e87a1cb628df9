//! Quoll daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};

use quoll::config::DaemonConfig;
use quoll::daemon::{self, DaemonStatus};
use quoll::modules;
use quoll_core::{Announcer, Dispatcher, Transport, init_tracing};

/// Interval between transport connection attempts.
const CONNECT_RETRY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(about = "Host-monitoring daemon publishing system metrics over Zenoh")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "quoll.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = DaemonConfig::load(&args.config)?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_tracing(&config.logging)?;

    tracing::info!(
        version = daemon::VERSION,
        config = %args.config.display(),
        "starting quoll"
    );

    let registry = modules::registry();
    let mut dispatcher = Dispatcher::new();
    dispatcher.add("", Box::new(DaemonStatus));
    for name in &config.modules {
        let ctx = config.module_ctx(name);
        let module = registry.build(name, &ctx)?;
        dispatcher.add(name.clone(), module);
    }
    let dispatcher = Arc::new(dispatcher);

    let base_topic = config.base_topic();
    let node_id = config.node_id();
    let announcer = Arc::new(Announcer::build(
        &config.discovery,
        &base_topic,
        &node_id,
        &dispatcher.entities(),
    )?);

    let (transport, events) = Transport::connect_with_retry(&config.transport, CONNECT_RETRY).await;
    let transport = Arc::new(transport);

    let supervisor = tokio::spawn(daemon::supervise(
        transport.clone(),
        events,
        dispatcher.clone(),
        announcer,
        base_topic.clone(),
    ));

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }

    tracing::info!("shutting down");
    supervisor.abort();
    dispatcher.close_all().await;
    transport.publish(&base_topic, "offline");
    transport.close().await;

    Ok(())
}
