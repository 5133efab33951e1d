//! The Tower Bridge: turns a flaky external device API into a steady stream
//! of normalized Bus events, combining a periodic polling fallback with
//! reconnect backoff and quiet-stream detection (§4.1).

use crate::backoff::Backoff;
use crate::bus::IncidentBus;
use crate::config::Config;
use crate::delta::DeltaEmitter;
use crate::jitter::Jitter;
use crate::model::{now_iso, BusEvent};
use crate::sleeper::Sleeper;
use crate::tower_client::TowerClient;
use crate::tower_stream::{StreamMessage, TowerStreamSource};
use futures_util::stream::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Drives both halves of §4.1: a persistent stream read via
/// [`TowerBridge::run_stream_loop`], reconnecting with backoff on drop, and a
/// polling fallback via [`TowerBridge::run_poll_loop`] that keeps correlation
/// alive regardless of stream health. Both feed the same Delta Emitter and
/// publish onto the Incident Bus.
pub struct TowerBridge {
    tower: Arc<dyn TowerClient>,
    stream_source: Arc<dyn TowerStreamSource>,
    bus: Arc<IncidentBus>,
    sleeper: Arc<dyn Sleeper>,
    emitter: Mutex<DeltaEmitter>,
    poll_interval: Duration,
    quiet_threshold: Duration,
    reconnect_base: Duration,
    reconnect_max: Duration,
    connected: AtomicBool,
    last_message_at: Mutex<Option<std::time::Instant>>,
    running: AtomicBool,
}

impl TowerBridge {
    pub fn new(
        tower: Arc<dyn TowerClient>,
        stream_source: Arc<dyn TowerStreamSource>,
        bus: Arc<IncidentBus>,
        sleeper: Arc<dyn Sleeper>,
        config: &Config,
    ) -> Self {
        Self {
            tower,
            stream_source,
            bus,
            sleeper,
            emitter: Mutex::new(DeltaEmitter::new(config.bootstrap_emit)),
            poll_interval: config.poll_interval,
            quiet_threshold: config.quiet_threshold,
            reconnect_base: config.reconnect_backoff_base,
            reconnect_max: config.reconnect_backoff_max,
            connected: AtomicBool::new(false),
            last_message_at: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// §4.1: reset delta memory on (re)connect so no spurious events fire for
    /// state that predates this connection, then mark connected.
    pub fn on_connect(&self) {
        self.emitter.lock().expect("delta emitter mutex poisoned").reset();
        self.connected.store(true, Ordering::SeqCst);
        *self.last_message_at.lock().expect("last-message mutex poisoned") =
            Some(std::time::Instant::now());
        self.bus.publish(BusEvent::BusReconnected { ts: now_iso() });
        info!("tower bridge connected");
    }

    pub fn on_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.bus.publish(BusEvent::BusDisconnected { ts: now_iso() });
        warn!("tower bridge disconnected");
    }

    /// Ingest one fetched snapshot: feed the Delta Emitter and publish the
    /// resulting events plus a `state.update`.
    fn ingest_snapshot(&self, snapshot: crate::model::Snapshot, source: &str) {
        let ts = now_iso();
        *self.last_message_at.lock().expect("last-message mutex poisoned") =
            Some(std::time::Instant::now());

        let events = self.emitter.lock().expect("delta emitter mutex poisoned").ingest(&snapshot, &ts, source);
        for event in events {
            self.bus.publish(event);
        }
        self.bus.publish(BusEvent::StateUpdate { site_id: "all".to_string(), payload: snapshot, ts });
    }

    /// §4.1: regardless of stream health, poll on an interval and feed the
    /// emitter. This is the loop that keeps correlation alive across stream
    /// outages; call it from a long-running task.
    pub async fn run_poll_loop(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.on_connect();

        while self.is_running() {
            match self.tower.get_state().await {
                Ok(snapshot) => self.ingest_snapshot(snapshot, "poll"),
                Err(err) => warn!(error = %err, "tower poll failed"),
            }
            self.check_quiet();
            self.sleeper.sleep(self.poll_interval).await;
        }
    }

    fn check_quiet(&self) {
        let last = *self.last_message_at.lock().expect("last-message mutex poisoned");
        if let Some(last) = last {
            if self.connected.load(Ordering::SeqCst) && last.elapsed() > self.quiet_threshold {
                warn!(elapsed = ?last.elapsed(), "tower stream quiet, no message received recently");
            }
        }
    }

    /// A single streaming message arrived; route it through the same ingest
    /// path so streaming and polling agree on ordering semantics.
    pub fn ingest_stream_message(&self, snapshot: crate::model::Snapshot) {
        self.ingest_snapshot(snapshot, "stream");
    }

    /// §4.1: exponential backoff, base/cap from config, ±20% jitter, looping
    /// reconnect attempts until `reconnect` produces a value or the bridge is
    /// stopped.
    pub async fn run_reconnect_loop<F, Fut, T>(&self, mut reconnect: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Option<T>>,
    {
        let backoff = Backoff::exponential(self.reconnect_base).with_max(self.reconnect_max);
        let jitter = Jitter::equal();
        let mut attempt = 1usize;

        self.on_disconnect();
        loop {
            if !self.is_running() {
                return None;
            }
            let delay = jitter.apply(backoff.delay(attempt));
            self.sleeper.sleep(delay).await;
            if let Some(value) = reconnect().await {
                self.on_connect();
                return Some(value);
            }
            attempt += 1;
        }
    }

    /// §4.1's primary path: hold a persistent connection to the simulator's
    /// streaming channel, feeding every snapshot message through the same
    /// ingest path the polling fallback uses. On disconnect (the stream
    /// ending or erroring), reconnect through [`TowerBridge::run_reconnect_loop`]
    /// before resuming. Intended to run alongside [`TowerBridge::run_poll_loop`]
    /// in its own task.
    pub async fn run_stream_loop(&self) {
        self.running.store(true, Ordering::SeqCst);

        let mut current = match self.stream_source.connect().await {
            Ok(messages) => {
                self.on_connect();
                Some(messages)
            }
            Err(err) => {
                warn!(error = %err, "tower stream connect failed");
                None
            }
        };

        while self.is_running() {
            let Some(messages) = current.as_mut() else {
                current = self
                    .run_reconnect_loop(|| async { self.stream_source.connect().await.ok() })
                    .await;
                continue;
            };

            match messages.next().await {
                Some(Ok(StreamMessage::Snapshot(snapshot))) => self.ingest_stream_message(snapshot),
                Some(Ok(StreamMessage::KeepAlive)) => {
                    *self.last_message_at.lock().expect("last-message mutex poisoned") =
                        Some(std::time::Instant::now());
                }
                Some(Err(err)) => {
                    warn!(error = %err, "tower stream read failed");
                    current = None;
                }
                None => {
                    current = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Service, Site};
    use crate::sleeper::InstantSleeper;
    use crate::tower_client::FakeTowerClient;
    use crate::tower_stream::fakes::ScriptedStreamSource;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    fn bridge_with(tower: Arc<dyn TowerClient>, stream_source: Arc<dyn TowerStreamSource>) -> TowerBridge {
        let bus = Arc::new(IncidentBus::new(100, 5));
        TowerBridge::new(tower, stream_source, bus, Arc::new(InstantSleeper), &Config::default())
    }

    fn bridge_with_tower(tower: Arc<dyn TowerClient>) -> TowerBridge {
        bridge_with(tower, Arc::new(ScriptedStreamSource::new(Vec::new())))
    }

    fn snapshot_with(site_id: &str, alarms: &[&str]) -> crate::model::Snapshot {
        let mut sites = BTreeMap::new();
        sites.insert(
            site_id.to_string(),
            Site {
                mains_on: true,
                site_alive: true,
                battery_percent: 90,
                antenna1: Service::Available,
                antenna2: Service::Available,
                alarms: alarms.iter().map(|s| s.to_string()).collect(),
            },
        );
        crate::model::Snapshot { sites }
    }

    #[tokio::test]
    async fn ingest_stream_message_publishes_delta_and_state_update() {
        let tower = FakeTowerClient::new(snapshot_with("S1", &[]));
        let bridge = bridge_with_tower(tower);
        bridge.on_connect();

        let (_, mut sub) = bridge.bus.subscribe();
        bridge.ingest_stream_message(snapshot_with("S1", &["MainsFailure"]));

        let first = sub.next().await.unwrap();
        assert!(matches!(first, BusEvent::AlarmRaised { .. }));
        let second = sub.next().await.unwrap();
        assert!(matches!(second, BusEvent::StateUpdate { .. }));
    }

    #[tokio::test]
    async fn reconnect_loop_retries_until_success() {
        let tower = FakeTowerClient::new(snapshot_with("S1", &[]));
        let bridge = bridge_with_tower(tower);
        bridge.running.store(true, Ordering::SeqCst);

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result = bridge
            .run_reconnect_loop(move || {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n >= 2 {
                        Some(())
                    } else {
                        None
                    }
                }
            })
            .await;

        assert_eq!(result, Some(()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stream_loop_ingests_snapshot_messages() {
        let tower = FakeTowerClient::new(snapshot_with("S1", &[]));
        let stream_source = Arc::new(ScriptedStreamSource::new(vec![Ok(vec![
            StreamMessage::KeepAlive,
            StreamMessage::Snapshot(snapshot_with("S1", &["MainsFailure"])),
        ])]));
        let bridge = Arc::new(bridge_with(tower, stream_source));
        let (_, mut sub) = bridge.bus.subscribe();

        let running = bridge.clone();
        let handle = tokio::spawn(async move { running.run_stream_loop().await });

        assert!(matches!(sub.next().await.unwrap(), BusEvent::BusReconnected { .. }));
        assert!(matches!(sub.next().await.unwrap(), BusEvent::AlarmRaised { .. }));
        assert!(matches!(sub.next().await.unwrap(), BusEvent::StateUpdate { .. }));

        bridge.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stream_loop_reconnects_after_disconnect() {
        let tower = FakeTowerClient::new(snapshot_with("S1", &[]));
        let stream_source = Arc::new(ScriptedStreamSource::new(vec![
            Ok(vec![StreamMessage::Snapshot(snapshot_with("S1", &["MainsFailure"]))]),
            Ok(vec![StreamMessage::Snapshot(snapshot_with("S1", &[]))]),
        ]));
        let bridge = Arc::new(bridge_with(tower, stream_source));
        let (_, mut sub) = bridge.bus.subscribe();

        let running = bridge.clone();
        let handle = tokio::spawn(async move { running.run_stream_loop().await });

        // First connection: connect, then its snapshot's alarm raised + state update.
        assert!(matches!(sub.next().await.unwrap(), BusEvent::BusReconnected { .. }));
        assert!(matches!(sub.next().await.unwrap(), BusEvent::AlarmRaised { .. }));
        assert!(matches!(sub.next().await.unwrap(), BusEvent::StateUpdate { .. }));
        // Stream ends, bridge reconnects; on_connect() resets the Delta Emitter
        // so the second connection's snapshot re-bootstraps rather than diffs
        // against state from the dropped connection (it carries no alarms, so
        // re-bootstrapping raises nothing).
        assert!(matches!(sub.next().await.unwrap(), BusEvent::BusDisconnected { .. }));
        assert!(matches!(sub.next().await.unwrap(), BusEvent::BusReconnected { .. }));
        assert!(matches!(sub.next().await.unwrap(), BusEvent::StateUpdate { .. }));

        bridge.stop();
        handle.await.unwrap();
    }
}
