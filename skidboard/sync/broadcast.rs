use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::EventRecord;
use shared_logging::LogLevel;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    snapshot::{PartialUpdate, Snapshot},
    telemetry::SyncTelemetry,
};

/// Operator-facing warning requested from the display layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advisory {
    /// Machine-readable reason, e.g. `valve_interlock`.
    pub kind: String,
    /// Text for the popup.
    pub message: String,
    /// Peer controllers and the states that caused the advisory.
    pub peers: Vec<(String, String)>,
    /// When the advisory was raised.
    pub raised_at: DateTime<Utc>,
}

/// Event delivered to a viewer.
#[derive(Debug, Clone)]
pub enum DisplayEvent {
    /// Full snapshot after a merge, on connect, or on request.
    DataUpdate(Arc<Snapshot>),
    /// Liveness signal, independent of data changes.
    Heartbeat {
        /// Emission time.
        timestamp: DateTime<Utc>,
    },
    /// Operator warning.
    Advisory(Arc<Advisory>),
}

impl DisplayEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DataUpdate(_) => "data_update",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Advisory(_) => "valve_control_popup",
        }
    }

    /// Structured body of the event.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::DataUpdate(snapshot) => {
                serde_json::to_value(snapshot.as_ref()).unwrap_or(Value::Null)
            }
            Self::Heartbeat { timestamp } => json!({ "timestamp": timestamp.to_rfc3339() }),
            Self::Advisory(advisory) => {
                serde_json::to_value(advisory.as_ref()).unwrap_or(Value::Null)
            }
        }
    }

    /// Wraps the event in a bus envelope.
    #[must_use]
    pub fn to_record(&self, source: &str) -> EventRecord {
        EventRecord::new(source, self.name(), self.payload())
    }
}

/// Identifies one viewer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end of a viewer registration. Dropping it releases the registration.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    receiver: mpsc::Receiver<DisplayEvent>,
    registry: Weak<Mutex<BroadcastState>>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(state) = self.registry.upgrade() {
            state.lock().subscribers.shift_remove(&self.id);
        }
    }
}

impl SubscriptionHandle {
    /// Registration id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next event; `None` once the broadcaster dropped this viewer.
    pub async fn recv(&mut self) -> Option<DisplayEvent> {
        self.receiver.recv().await
    }

    /// Next queued event, if any.
    pub fn try_recv(&mut self) -> Option<DisplayEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Liveness summary for health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Always `healthy` while the process answers.
    pub status: String,
    /// Time of the report.
    pub timestamp: DateTime<Utc>,
    /// Connected viewers.
    pub subscribers: usize,
    /// Snapshot version.
    pub version: u64,
    /// Time of the last merge.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum DropReason {
    Disconnected,
    Backlogged,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Backlogged => "backlogged",
        }
    }
}

struct BroadcastState {
    snapshot: Snapshot,
    subscribers: IndexMap<SubscriptionId, mpsc::Sender<DisplayEvent>>,
}

/// Owner of the single snapshot and of every viewer registration.
///
/// Merges, registrations and fan-out share one lock, so every viewer sees the version it
/// connected at followed by each later version exactly once. Point reads go through a
/// separately published copy and never wait on fan-out.
pub struct SnapshotBroadcaster {
    state: Arc<Mutex<BroadcastState>>,
    latest: RwLock<Arc<Snapshot>>,
    queue_capacity: usize,
    next_id: AtomicU64,
    telemetry: SyncTelemetry,
}

impl fmt::Debug for SnapshotBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotBroadcaster")
            .field("version", &self.latest.read().version)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl SnapshotBroadcaster {
    /// Starts from the default snapshot. Each viewer may queue `queue_capacity` events
    /// before it is disconnected.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self::with_snapshot(Snapshot::default(), queue_capacity)
    }

    /// Starts from a given snapshot.
    #[must_use]
    pub fn with_snapshot(snapshot: Snapshot, queue_capacity: usize) -> Self {
        let latest = Arc::new(snapshot.clone());
        Self {
            state: Arc::new(Mutex::new(BroadcastState {
                snapshot,
                subscribers: IndexMap::new(),
            })),
            latest: RwLock::new(latest),
            queue_capacity: queue_capacity.max(1),
            next_id: AtomicU64::new(1),
            telemetry: SyncTelemetry::disabled("broadcaster"),
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: SyncTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Applies the present fields of `update`, stamps the merge and pushes the full
    /// snapshot to every viewer. An empty update changes nothing.
    pub fn merge(&self, update: &PartialUpdate) -> Arc<Snapshot> {
        if update.is_empty() {
            return self.latest();
        }
        let (merged, dropped) = {
            let mut state = self.state.lock();
            state.snapshot.apply(update, Utc::now());
            let merged = Arc::new(state.snapshot.clone());
            *self.latest.write() = Arc::clone(&merged);
            let dropped = deliver(
                &mut state.subscribers,
                &DisplayEvent::DataUpdate(Arc::clone(&merged)),
            );
            (merged, dropped)
        };
        self.report_dropped(&dropped);
        merged
    }

    /// Registers a viewer and queues the current snapshot as its first event.
    pub fn subscribe(&self) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let count = {
            let mut state = self.state.lock();
            let current = self.latest();
            // Fresh channel with capacity >= 1: cannot be full.
            let _ = sender.try_send(DisplayEvent::DataUpdate(current));
            state.subscribers.insert(id, sender);
            state.subscribers.len()
        };
        self.telemetry.log(
            LogLevel::Info,
            "subscriber.connected",
            json!({ "id": id.to_string(), "subscribers": count }),
        );
        SubscriptionHandle {
            id,
            receiver,
            registry: Arc::downgrade(&self.state),
        }
    }

    /// Removes a viewer. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (removed, count) = {
            let mut state = self.state.lock();
            let removed = state.subscribers.shift_remove(&id).is_some();
            (removed, state.subscribers.len())
        };
        if removed {
            self.telemetry.log(
                LogLevel::Info,
                "subscriber.disconnected",
                json!({ "id": id.to_string(), "subscribers": count }),
            );
        }
        removed
    }

    /// Sends the current snapshot to one viewer only. Returns whether it was queued.
    pub fn resync(&self, id: SubscriptionId) -> bool {
        let dropped = {
            let mut state = self.state.lock();
            let Some(sender) = state.subscribers.get(&id) else {
                return false;
            };
            let event = DisplayEvent::DataUpdate(self.latest());
            match try_deliver(sender, event) {
                Ok(()) => return true,
                Err(reason) => {
                    state.subscribers.shift_remove(&id);
                    vec![(id, reason)]
                }
            }
        };
        self.report_dropped(&dropped);
        false
    }

    /// Point-in-time copy of the snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.latest.read().as_ref().clone()
    }

    /// Shared handle to the latest snapshot.
    #[must_use]
    pub fn latest(&self) -> Arc<Snapshot> {
        self.latest.read().clone()
    }

    /// Pushes a timestamp-only liveness event to every viewer.
    pub fn heartbeat(&self) -> DateTime<Utc> {
        let timestamp = Utc::now();
        self.fan_out(&DisplayEvent::Heartbeat { timestamp });
        timestamp
    }

    /// Pushes an operator advisory to every viewer.
    pub fn advise(&self, advisory: Advisory) {
        let payload = json!({ "kind": advisory.kind, "peers": advisory.peers });
        self.fan_out(&DisplayEvent::Advisory(Arc::new(advisory)));
        self.telemetry.event("skid.interlock.advisory", payload);
    }

    /// Number of registered viewers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Health summary.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let latest = self.latest();
        HealthReport {
            status: "healthy".into(),
            timestamp: Utc::now(),
            subscribers: self.subscriber_count(),
            version: latest.version,
            updated_at: latest.updated_at,
        }
    }

    fn fan_out(&self, event: &DisplayEvent) {
        let dropped = deliver(&mut self.state.lock().subscribers, event);
        self.report_dropped(&dropped);
    }

    fn report_dropped(&self, dropped: &[(SubscriptionId, DropReason)]) {
        for (id, reason) in dropped {
            self.telemetry.log(
                LogLevel::Warn,
                "subscriber.dropped",
                json!({ "id": id.to_string(), "reason": reason.as_str() }),
            );
            self.telemetry.event(
                "skid.subscriber.dropped",
                json!({ "id": id.to_string(), "reason": reason.as_str() }),
            );
        }
    }
}

fn try_deliver(sender: &mpsc::Sender<DisplayEvent>, event: DisplayEvent) -> Result<(), DropReason> {
    sender.try_send(event).map_err(|err| match err {
        TrySendError::Full(_) => DropReason::Backlogged,
        TrySendError::Closed(_) => DropReason::Disconnected,
    })
}

fn deliver(
    subscribers: &mut IndexMap<SubscriptionId, mpsc::Sender<DisplayEvent>>,
    event: &DisplayEvent,
) -> Vec<(SubscriptionId, DropReason)> {
    let mut dropped = Vec::new();
    subscribers.retain(|id, sender| match try_deliver(sender, event.clone()) {
        Ok(()) => true,
        Err(reason) => {
            dropped.push((*id, reason));
            false
        }
    });
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        selector::SelectorState,
        snapshot::{PumpUpdate, TankUpdate},
    };
    use shared_event_bus::MemoryEventBus;
    use std::time::Duration;

    fn data(event: DisplayEvent) -> Arc<Snapshot> {
        match event {
            DisplayEvent::DataUpdate(snapshot) => snapshot,
            other => panic!("expected data update, got {}", other.name()),
        }
    }

    fn tank(level_mm: f64) -> PartialUpdate {
        PartialUpdate::new().with_tank(TankUpdate {
            level_mm: Some(level_mm),
            level_percent: None,
        })
    }

    #[test]
    fn subscribe_delivers_current_snapshot_first() {
        let broadcaster = SnapshotBroadcaster::new(8);
        broadcaster.merge(&tank(900.0));
        let mut handle = broadcaster.subscribe();
        let first = data(handle.try_recv().unwrap());
        assert_eq!(first.version, 1);
        assert!((first.tank.level_mm - 900.0).abs() < f64::EPSILON);
        assert!(handle.try_recv().is_none());

        broadcaster.merge(&PartialUpdate::new().with_selector_state(SelectorState::BothLocal));
        let second = data(handle.try_recv().unwrap());
        assert_eq!(second.version, 2);
        assert_eq!(second.selector_state, SelectorState::BothLocal);
        assert!((second.tank.level_mm - 900.0).abs() < f64::EPSILON);
    }

    #[test]
    fn every_viewer_gets_the_full_snapshot() {
        let broadcaster = SnapshotBroadcaster::new(8);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();
        a.try_recv().unwrap();
        b.try_recv().unwrap();
        broadcaster.merge(&PartialUpdate::new().with_valve_state(false));
        let from_a = data(a.try_recv().unwrap());
        let from_b = data(b.try_recv().unwrap());
        assert_eq!(from_a, from_b);
        assert!(!from_a.valve_state);
        assert_eq!(from_a.pump.state, "standby");
    }

    #[test]
    fn empty_merge_is_a_no_op() {
        let broadcaster = SnapshotBroadcaster::new(8);
        let mut handle = broadcaster.subscribe();
        handle.try_recv().unwrap();
        let result = broadcaster.merge(&PartialUpdate::new());
        assert_eq!(result.version, 0);
        assert!(handle.try_recv().is_none());
    }

    #[test]
    fn dropped_handle_releases_its_registration_at_once() {
        let broadcaster = SnapshotBroadcaster::new(4);
        let gone = broadcaster.subscribe();
        let _kept = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);
        drop(gone);
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(broadcaster.health().subscribers, 1);
    }

    #[test]
    fn handle_outliving_the_broadcaster_drops_quietly() {
        let broadcaster = SnapshotBroadcaster::new(4);
        let mut handle = broadcaster.subscribe();
        drop(broadcaster);
        assert!(handle.try_recv().is_some());
        assert!(handle.try_recv().is_none());
    }

    #[test]
    fn closed_and_backlogged_viewers_are_dropped_in_isolation() {
        let broadcaster = SnapshotBroadcaster::new(2);
        let closed = broadcaster.subscribe();
        let mut slow = broadcaster.subscribe();
        let mut healthy = broadcaster.subscribe();
        drop(closed);
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.merge(&tank(1.0));
        assert_eq!(broadcaster.subscriber_count(), 2);
        healthy.try_recv().unwrap();
        healthy.try_recv().unwrap();

        // `slow` still holds two undrained events; the next push overflows it.
        broadcaster.merge(&tank(2.0));
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert!((data(healthy.try_recv().unwrap()).tank.level_mm - 2.0).abs() < f64::EPSILON);
        assert!((broadcaster.snapshot().tank.level_mm - 2.0).abs() < f64::EPSILON);

        assert_eq!(data(slow.try_recv().unwrap()).version, 0);
        assert_eq!(data(slow.try_recv().unwrap()).version, 1);
        assert!(slow.try_recv().is_none());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let broadcaster = SnapshotBroadcaster::new(4);
        let handle = broadcaster.subscribe();
        assert!(broadcaster.unsubscribe(handle.id()));
        assert!(!broadcaster.unsubscribe(handle.id()));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn heartbeat_carries_only_a_timestamp() {
        let broadcaster = SnapshotBroadcaster::new(4);
        let mut handle = broadcaster.subscribe();
        handle.try_recv().unwrap();
        let sent = broadcaster.heartbeat();
        match handle.try_recv().unwrap() {
            DisplayEvent::Heartbeat { timestamp } => assert_eq!(timestamp, sent),
            other => panic!("expected heartbeat, got {}", other.name()),
        }
        assert_eq!(broadcaster.snapshot().version, 0);
    }

    #[test]
    fn resync_targets_one_viewer() {
        let broadcaster = SnapshotBroadcaster::new(4);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();
        a.try_recv().unwrap();
        b.try_recv().unwrap();
        assert!(broadcaster.resync(a.id()));
        assert_eq!(data(a.try_recv().unwrap()).version, 0);
        assert!(b.try_recv().is_none());
        broadcaster.unsubscribe(b.id());
        assert!(!broadcaster.resync(b.id()));
    }

    #[test]
    fn health_reports_viewers_and_version() {
        let broadcaster = SnapshotBroadcaster::new(4);
        let _viewer = broadcaster.subscribe();
        broadcaster.merge(&tank(5.0));
        let health = broadcaster.health();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.subscribers, 1);
        assert_eq!(health.version, 1);
    }

    #[tokio::test]
    async fn advisory_reaches_viewers_and_bus() {
        let bus = Arc::new(MemoryEventBus::new(8));
        let telemetry = SyncTelemetry::builder("broadcaster")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let broadcaster = SnapshotBroadcaster::new(4).with_telemetry(telemetry);
        let mut handle = broadcaster.subscribe();
        handle.recv().await.unwrap();
        broadcaster.advise(Advisory {
            kind: "valve_interlock".into(),
            message: "pump in calibration".into(),
            peers: vec![("pump-1".into(), "calibration".into())],
            raised_at: Utc::now(),
        });
        let event = handle.recv().await.unwrap();
        assert_eq!(event.name(), "valve_control_popup");
        assert_eq!(event.payload()["kind"], "valve_interlock");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.recent_of("skid.interlock.advisory").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_disjoint_merges_keep_both_sections() {
        let broadcaster = Arc::new(SnapshotBroadcaster::new(512));
        let mut viewer = broadcaster.subscribe();
        let tank_writer = {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move {
                for i in 1..=100_u32 {
                    broadcaster.merge(&tank(f64::from(i)));
                    tokio::task::yield_now().await;
                }
            })
        };
        let pump_writer = {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move {
                for i in 1..=100_u32 {
                    broadcaster.merge(&PartialUpdate::new().with_pump(PumpUpdate {
                        flow_rate: Some(f64::from(i)),
                        ..PumpUpdate::default()
                    }));
                    tokio::task::yield_now().await;
                }
            })
        };
        tank_writer.await.unwrap();
        pump_writer.await.unwrap();

        let snapshot = broadcaster.snapshot();
        assert_eq!(snapshot.version, 200);
        assert!((snapshot.tank.level_mm - 100.0).abs() < f64::EPSILON);
        assert!((snapshot.pump.flow_rate - 100.0).abs() < f64::EPSILON);

        // The viewer saw every version once, in order, and no section ever went backwards.
        let mut expected = 0;
        let (mut last_tank, mut last_flow) = (0.0, 0.0);
        while let Some(event) = viewer.try_recv() {
            let seen = data(event);
            assert_eq!(seen.version, expected);
            assert!(seen.tank.level_mm >= last_tank);
            assert!(seen.pump.flow_rate >= last_flow);
            last_tank = seen.tank.level_mm;
            last_flow = seen.pump.flow_rate;
            expected += 1;
        }
        assert_eq!(expected, 201);
    }
}
