//! Per-sensor refresh scheduling: periodic, on demand, and forced.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};

use crate::config::{format_period, parse_period};
use crate::pubsub::{PubSubCell, PubSubHandle};

/// Future returned by a refresh callback.
pub type RefreshFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Calls a refresh function periodically, or when explicitly refreshed.
///
/// Two tasks cooperate: a dispatch task that serializes callback
/// invocations requested over a hand-off channel, and a tick task that
/// requests an unforced invocation every period. The flag passed to the
/// callback indicates whether the refresh was forced. Invocations on one
/// poller never overlap.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<Inner>,
}

struct Inner {
    refresh: mpsc::Sender<bool>,
    period: watch::Sender<Duration>,
    reset: Notify,
    done: watch::Sender<bool>,
}

impl Poller {
    /// Spawn the dispatch and tick tasks for a new poller.
    pub fn new<F>(period: Duration, mut refresh: F) -> Self
    where
        F: FnMut(bool) -> RefreshFuture + Send + 'static,
    {
        let (refresh_tx, mut refresh_rx) = mpsc::channel::<bool>(1);
        let (period_tx, _) = watch::channel(period);
        let (done_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            refresh: refresh_tx,
            period: period_tx,
            reset: Notify::new(),
            done: done_tx,
        });

        let mut done = inner.done.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = async { let _ = done.wait_for(|d| *d).await; } => break,
                    request = refresh_rx.recv() => match request {
                        Some(forced) => refresh(forced).await,
                        None => break,
                    },
                }
            }
        });

        let tick = inner.clone();
        let mut done = inner.done.subscribe();
        tokio::spawn(async move {
            loop {
                let period = *tick.period.borrow();
                tokio::select! {
                    biased;
                    _ = async { let _ = done.wait_for(|d| *d).await; } => break,
                    _ = tick.reset.notified() => continue,
                    _ = tokio::time::sleep(period) => {
                        tokio::select! {
                            biased;
                            _ = async { let _ = done.wait_for(|d| *d).await; } => break,
                            _ = tick.refresh.send(false) => {}
                        }
                    }
                }
            }
        });

        Self { inner }
    }

    /// Request an immediate invocation of the refresh callback.
    ///
    /// Returns once the request is accepted, not once the callback has
    /// run. A safe no-op after [`close`](Self::close).
    pub async fn refresh(&self, forced: bool) {
        let mut done = self.inner.done.subscribe();
        tokio::select! {
            biased;
            _ = done.wait_for(|d| *d) => {}
            _ = self.inner.refresh.send(forced) => {}
        }
    }

    /// Replace the polling period.
    ///
    /// Triggers one immediate unforced invocation; the ticker is reset to
    /// the new period only after that request is accepted.
    pub async fn update_period(&self, period: Duration) {
        if *self.inner.done.borrow() {
            return;
        }
        self.inner.period.send_replace(period);
        self.refresh(false).await;
        self.inner.reset.notify_one();
    }

    /// The current polling period.
    pub fn period(&self) -> Duration {
        *self.inner.period.borrow()
    }

    /// Stop both tasks. Idempotent; later `refresh`/`update_period` calls
    /// return without invoking the callback.
    pub fn close(&self) {
        self.inner.done.send_replace(true);
    }
}

/// A sensor whose state is regularly polled and republished.
///
/// Binds a [`Poller`] to a topic and a pub/sub handle, and exposes the
/// sensor's remote-control surface as subscriptions.
pub struct PolledSensor {
    topic: String,
    poller: Poller,
    ps: PubSubCell,
}

impl PolledSensor {
    /// Create a sensor around an existing poller.
    ///
    /// `cell` is the binding shared with the owning module's refresh
    /// callback; it starts out bound to the stub.
    pub fn new(topic: impl Into<String>, poller: Poller, cell: PubSubCell) -> Self {
        Self {
            topic: topic.into(),
            poller,
            ps: cell,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Bind the sensor to a pub/sub handle and keep it synchronized.
    ///
    /// Forces one refresh so a fresh value is published promptly, then
    /// exposes the control topics: `<topic>/rqd` triggers a forced
    /// refresh, `<topic>/rqd/poll_period` takes a duration string and
    /// updates the polling period (invalid strings are ignored). The
    /// current period is published to `<topic>/poll_period`.
    pub async fn sync(&self, ps: PubSubHandle) {
        self.ps.replace(ps.clone());
        self.poller.refresh(true).await;

        let poller = self.poller.clone();
        ps.subscribe(
            &format!("{}/rqd", self.topic),
            Arc::new(move |_| {
                let poller = poller.clone();
                tokio::spawn(async move { poller.refresh(true).await });
            }),
        );

        ps.publish(
            &format!("{}/poll_period", self.topic),
            &format_period(self.poller.period()),
        );

        let poller = self.poller.clone();
        let topic = self.topic.clone();
        let reply = self.ps.clone();
        ps.subscribe(
            &format!("{}/rqd/poll_period", self.topic),
            Arc::new(move |payload| {
                let Ok(text) = std::str::from_utf8(payload) else {
                    return;
                };
                let Ok(period) = parse_period(text) else {
                    return;
                };
                let poller = poller.clone();
                let topic = topic.clone();
                let reply = reply.clone();
                tokio::spawn(async move {
                    poller.update_period(period).await;
                    reply.publish(&format!("{}/poll_period", topic), &format_period(period));
                });
            }),
        );
    }

    /// Stop polling the sensor. Safe to call more than once.
    pub fn close(&self) {
        self.poller.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingPubSub;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_poller(period: Duration) -> (Poller, Arc<Mutex<Vec<bool>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let poller = Poller::new(period, move |forced| {
            let recorded = recorded.clone();
            Box::pin(async move {
                recorded.lock().unwrap().push(forced);
            })
        });
        (poller, calls)
    }

    async fn settle() {
        // Lets spawned tasks and queued refreshes run under paused time.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_unforced() {
        let (poller, calls) = recording_poller(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(calls.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*calls.lock().unwrap(), vec![false]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*calls.lock().unwrap(), vec![false, false]);

        poller.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_forced_and_immediate() {
        let (poller, calls) = recording_poller(Duration::from_secs(60));

        poller.refresh(true).await;
        settle().await;
        assert_eq!(*calls.lock().unwrap(), vec![true]);

        poller.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_period_refreshes_and_reschedules() {
        let (poller, calls) = recording_poller(Duration::from_secs(60));

        poller.update_period(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(*calls.lock().unwrap(), vec![false]);
        assert_eq!(poller.period(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(*calls.lock().unwrap(), vec![false, false]);

        poller.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_nonblocking() {
        let (poller, calls) = recording_poller(Duration::from_secs(1));

        poller.close();
        poller.close();
        settle().await;

        poller.refresh(true).await;
        poller.update_period(Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invocations_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let (a, o, r) = (active.clone(), overlaps.clone(), runs.clone());
        let poller = Poller::new(Duration::from_secs(1), move |_| {
            let (a, o, r) = (a.clone(), o.clone(), r.clone());
            Box::pin(async move {
                if a.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                r.fetch_add(1, Ordering::SeqCst);
            })
        });

        let contender = poller.clone();
        let task = tokio::spawn(async move {
            for _ in 0..5 {
                contender.refresh(true).await;
            }
        });
        tokio::time::sleep(Duration::from_secs(10)).await;
        task.await.unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(runs.load(Ordering::SeqCst) >= 5);

        poller.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_forces_refresh_before_first_tick() {
        let cell = PubSubCell::new();
        let (poller, calls) = recording_poller(Duration::from_secs(60));
        let sensor = PolledSensor::new("/cpu", poller, cell);

        let rec = RecordingPubSub::new();
        sensor.sync(rec.clone()).await;
        settle().await;

        assert_eq!(*calls.lock().unwrap(), vec![true]);
        assert_eq!(rec.messages_for("/cpu/poll_period"), vec!["1m"]);
        assert!(rec.subscribed("/cpu/rqd"));
        assert!(rec.subscribed("/cpu/rqd/poll_period"));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(*calls.lock().unwrap(), vec![true, false]);

        sensor.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rqd_triggers_forced_refresh() {
        let cell = PubSubCell::new();
        let (poller, calls) = recording_poller(Duration::from_secs(60));
        let sensor = PolledSensor::new("/mem", poller, cell);

        let rec = RecordingPubSub::new();
        sensor.sync(rec.clone()).await;
        settle().await;

        rec.deliver("/mem/rqd", b"");
        settle().await;
        assert_eq!(*calls.lock().unwrap(), vec![true, true]);

        sensor.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_period_update_via_control_topic() {
        let cell = PubSubCell::new();
        let (poller, calls) = recording_poller(Duration::from_secs(60));
        let sensor = PolledSensor::new("/mem", poller, cell);

        let rec = RecordingPubSub::new();
        sensor.sync(rec.clone()).await;
        settle().await;

        rec.deliver("/mem/rqd/poll_period", b"30s");
        settle().await;

        assert_eq!(sensor.poller().period(), Duration::from_secs(30));
        assert_eq!(rec.messages_for("/mem/poll_period"), vec!["1m", "30s"]);
        // the period change itself refreshes, unforced
        assert_eq!(*calls.lock().unwrap(), vec![true, false]);

        sensor.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_poll_period_is_ignored() {
        let cell = PubSubCell::new();
        let (poller, calls) = recording_poller(Duration::from_secs(60));
        let sensor = PolledSensor::new("/mem", poller, cell);

        let rec = RecordingPubSub::new();
        sensor.sync(rec.clone()).await;
        settle().await;

        rec.deliver("/mem/rqd/poll_period", b"not a duration");
        rec.deliver("/mem/rqd/poll_period", &[0xff, 0xfe]);
        settle().await;

        assert_eq!(sensor.poller().period(), Duration::from_secs(60));
        assert_eq!(rec.messages_for("/mem/poll_period"), vec!["1m"]);
        assert_eq!(*calls.lock().unwrap(), vec![true]);

        sensor.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_optional_sensor_close_is_safe() {
        let sensor: Option<PolledSensor> = None;
        if let Some(sensor) = &sensor {
            sensor.close();
        }
    }
}
