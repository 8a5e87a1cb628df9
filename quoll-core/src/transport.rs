//! Zenoh transport adapter.
//!
//! The core sees the transport only through the [`PubSub`] contract;
//! this module supplies the Zenoh-backed implementation: session setup,
//! the connect/retry loop, an ordered publish funnel, and topic-scoped
//! handles whose subscriptions die with the handle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::pubsub::{Handler, PubSub, PubSubHandle};

/// Event emitted when the transport (re)establishes its connection.
#[derive(Debug, Clone, Copy)]
pub struct Connected;

enum Command {
    Put { key: String, value: String },
    Shutdown,
}

/// A connected Zenoh session.
///
/// All publishes are funnelled through one writer task so that values
/// queued in sequence reach the session in order.
pub struct Transport {
    session: Arc<zenoh::Session>,
    commands: mpsc::UnboundedSender<Command>,
    writer: Mutex<Option<JoinHandle<()>>>,
    /// Held so the reconnect event channel stays open for the supervisor.
    #[allow(dead_code)]
    events: mpsc::Sender<Connected>,
}

impl Transport {
    /// Open a session with the given configuration.
    ///
    /// Returns the transport and a channel that delivers one event per
    /// (re)connection; the supervisor re-syncs modules on every event.
    pub async fn connect(config: &TransportConfig) -> Result<(Self, mpsc::Receiver<Connected>)> {
        let session = open_session(config).await?;
        let session = Arc::new(session);

        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let writer_session = session.clone();
        let writer = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    Command::Put { key, value } => {
                        tracing::debug!(key = %key, value = %value, "publish");
                        if let Err(e) = writer_session.put(&key, value).await {
                            tracing::warn!(key = %key, error = %e, "publish failed");
                        }
                    }
                    Command::Shutdown => break,
                }
            }
        });

        let (events, events_rx) = mpsc::channel(1);
        let _ = events.try_send(Connected);

        Ok((
            Self {
                session,
                commands,
                writer: Mutex::new(Some(writer)),
                events,
            },
            events_rx,
        ))
    }

    /// Open a session, retrying on a fixed interval until it succeeds.
    pub async fn connect_with_retry(
        config: &TransportConfig,
        retry: Duration,
    ) -> (Self, mpsc::Receiver<Connected>) {
        loop {
            match Self::connect(config).await {
                Ok(connected) => return connected,
                Err(e) => {
                    tracing::warn!(error = %e, retry = ?retry, "connect failed, retrying");
                    tokio::time::sleep(retry).await;
                }
            }
        }
    }

    /// Queue a publication on an absolute key; delivery order follows
    /// call order.
    pub fn publish(&self, key: &str, value: &str) {
        let command = Command::Put {
            key: key.to_string(),
            value: value.to_string(),
        };
        if self.commands.send(command).is_err() {
            tracing::warn!(key = %key, "publish after transport close");
        }
    }

    /// Subscribe to an absolute key; the guard unsubscribes on drop.
    pub fn subscribe(&self, key: &str, handler: Handler) -> SubscriptionGuard {
        spawn_subscriber(self.session.clone(), key.to_string(), handler)
    }

    /// A pub/sub handle scoped to a base topic.
    ///
    /// An empty base topic yields a handle over absolute topics.
    pub fn scoped(&self, base_topic: &str) -> PubSubHandle {
        Arc::new(ScopedPubSub {
            base: base_topic.to_string(),
            commands: self.commands.clone(),
            session: self.session.clone(),
            guards: Mutex::new(Vec::new()),
        })
    }

    /// Flush queued publications and close the session.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let writer = self.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        if let Err(e) = self.session.close().await {
            tracing::warn!(error = %e, "error closing session");
        }
    }
}

async fn open_session(config: &TransportConfig) -> Result<zenoh::Session> {
    let mut zenoh_config = zenoh::Config::default();

    let mode = match config.mode.as_str() {
        "client" | "peer" | "router" => format!("\"{}\"", config.mode),
        other => {
            return Err(Error::Config(format!(
                "invalid transport mode: '{}'. expected 'client', 'peer', or 'router'",
                other
            )));
        }
    };

    zenoh_config
        .insert_json5("mode", &mode)
        .map_err(|e| Error::Config(format!("failed to set mode: {}", e)))?;

    if !config.connect.is_empty() {
        let endpoints = serde_json::to_string(&config.connect)?;
        zenoh_config
            .insert_json5("connect/endpoints", &endpoints)
            .map_err(|e| Error::Config(format!("failed to set connect endpoints: {}", e)))?;
    }

    if !config.listen.is_empty() {
        let endpoints = serde_json::to_string(&config.listen)?;
        zenoh_config
            .insert_json5("listen/endpoints", &endpoints)
            .map_err(|e| Error::Config(format!("failed to set listen endpoints: {}", e)))?;
    }

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "connecting to Zenoh"
    );

    let session = zenoh::open(zenoh_config)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    tracing::info!(zid = %session.zid(), "transport connected");

    Ok(session)
}

fn spawn_subscriber(
    session: Arc<zenoh::Session>,
    key: String,
    handler: Handler,
) -> SubscriptionGuard {
    let task = tokio::spawn(async move {
        let subscriber = match session.declare_subscriber(&key).await {
            Ok(subscriber) => subscriber,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "subscribe failed");
                return;
            }
        };
        tracing::debug!(key = %key, "subscribed");
        while let Ok(sample) = subscriber.recv_async().await {
            handler(&sample.payload().to_bytes());
        }
    });
    SubscriptionGuard { task }
}

/// Aborts its subscriber task when dropped.
pub struct SubscriptionGuard {
    task: JoinHandle<()>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Join a base topic and a relative topic.
///
/// Relative topics carry a leading '/'; the empty topic addresses the
/// base itself. With an empty base the topic is taken as absolute.
pub fn join_topic(base: &str, topic: &str) -> String {
    if topic.is_empty() {
        base.to_string()
    } else if base.is_empty() {
        topic.trim_start_matches('/').to_string()
    } else {
        format!("{}{}", base, topic)
    }
}

struct ScopedPubSub {
    base: String,
    commands: mpsc::UnboundedSender<Command>,
    session: Arc<zenoh::Session>,
    guards: Mutex<Vec<SubscriptionGuard>>,
}

impl PubSub for ScopedPubSub {
    fn publish(&self, topic: &str, value: &str) {
        let key = join_topic(&self.base, topic);
        let command = Command::Put {
            key: key.clone(),
            value: value.to_string(),
        };
        if self.commands.send(command).is_err() {
            tracing::warn!(key = %key, "publish after transport close");
        }
    }

    fn subscribe(&self, topic: &str, handler: Handler) {
        let key = join_topic(&self.base, topic);
        let guard = spawn_subscriber(self.session.clone(), key, handler);
        self.guards.lock().unwrap().push(guard);
    }
}
