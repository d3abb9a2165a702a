use std::{fmt, sync::Arc, time::Duration};

use serde_json::json;
use shared_logging::LogLevel;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use crate::{
    aggregate::{pump_tags, TelemetryAggregator},
    broadcast::SnapshotBroadcaster,
    config::SkidConfig,
    faults::evaluate_peers,
    interlock::ValveInterlock,
    selector::SelectorStateMachine,
    snapshot::{PartialUpdate, Snapshot, STANDBY},
    tags::{ControllerId, Pin, TagSource, TagValue},
    telemetry::SyncTelemetry,
};

/// Pump operating state that counts as the skid running.
pub const AUTO_STATE: &str = "auto";

/// System status while any pump runs in auto.
pub const RUNNING: &str = "running";

/// Samples every input once per period and merges the result as one update.
pub struct TickDriver {
    tags: Arc<dyn TagSource>,
    interlock: Arc<ValveInterlock>,
    aggregator: TelemetryAggregator,
    selector: SelectorStateMachine,
    selector_pins: (Pin, Pin),
    pumps: Vec<ControllerId>,
    telemetry: SyncTelemetry,
}

impl fmt::Debug for TickDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickDriver")
            .field("selector", &self.selector)
            .field("selector_pins", &self.selector_pins)
            .field("pumps", &self.pumps)
            .finish_non_exhaustive()
    }
}

impl TickDriver {
    /// Driver for the site described by `config`.
    #[must_use]
    pub fn new(
        config: &SkidConfig,
        tags: Arc<dyn TagSource>,
        interlock: Arc<ValveInterlock>,
    ) -> Self {
        let controllers = &config.controllers;
        let aggregator = TelemetryAggregator::new(Arc::clone(&tags), controllers.pumps.clone())
            .solar_pool(controllers.solar.clone())
            .tank_level(controllers.tank_level.clone())
            .skid_sensors(
                controllers.flow_sensor.clone(),
                controllers.pressure_sensor.clone(),
            );
        Self {
            tags,
            interlock,
            aggregator,
            selector: SelectorStateMachine::new(config.selector.threshold),
            selector_pins: (config.pins.pump1_selector, config.pins.pump2_selector),
            pumps: controllers.pumps.clone(),
            telemetry: SyncTelemetry::disabled("driver"),
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: SyncTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Runs one sampling pass and returns the snapshot after the merge.
    ///
    /// Inputs that cannot be read leave their snapshot fields untouched.
    pub async fn tick(&self) -> Arc<Snapshot> {
        let mut update = PartialUpdate::new();

        let (pin1, pin2) = self.selector_pins;
        match (
            self.tags.read_analog(pin1).await,
            self.tags.read_analog(pin2).await,
        ) {
            (Some(pump1), Some(pump2)) => {
                update = update.with_selector_state(self.selector.derive(pump1, pump2));
            }
            (pump1, pump2) => self.telemetry.log(
                LogLevel::Debug,
                "selector.unreadable",
                json!({ "pump1": pump1, "pump2": pump2 }),
            ),
        }

        let mut states = Vec::with_capacity(self.pumps.len());
        for pump in &self.pumps {
            let state = self.tags.read_tag(pump_tags::APP_STATE, pump).await;
            states.push(state.as_ref().and_then(TagValue::as_str).map(str::to_owned));
        }
        if states.iter().any(Option::is_some) {
            update = update.with_faults(evaluate_peers(states.iter().map(Option::as_deref)));
            let running = states.iter().flatten().any(|state| state == AUTO_STATE);
            update = update.with_system_status(if running { RUNNING } else { STANDBY });
        }

        let readings = self.aggregator.aggregate().await;
        if let Some(pump) = readings.pump {
            update = update.with_pump(pump);
        }
        if let Some(pump) = readings.pump2 {
            update = update.with_pump2(pump);
        }
        if let Some(solar) = readings.solar {
            update = update.with_solar(solar);
        }
        if let Some(tank) = readings.tank {
            update = update.with_tank(tank);
        }
        if let Some(skid) = readings.skid {
            update = update.with_skid(skid);
        }

        let snapshot = self.interlock.merge_with_valve_state(update).await;
        self.telemetry.event(
            "skid.tick.completed",
            json!({ "version": snapshot.version, "selector": u8::from(snapshot.selector_state) }),
        );
        snapshot
    }

    /// Ticks every `period` until `shutdown` turns true or its sender is dropped.
    /// Late ticks are skipped, not replayed.
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.telemetry.log(
            LogLevel::Info,
            "driver.started",
            json!({ "period": format!("{period:?}") }),
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.telemetry
            .log(LogLevel::Info, "driver.stopped", json!({}));
    }
}

/// Spawns the heartbeat task: one timestamp-only event per `period` until shutdown.
pub fn spawn_heartbeat(
    broadcaster: Arc<SnapshotBroadcaster>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately; the connect snapshot already covers it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    broadcaster.heartbeat();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broadcast::DisplayEvent,
        error::SyncError,
        interlock::ValvePins,
        selector::SelectorState,
        tags::MemoryTagSource,
    };
    use async_trait::async_trait;

    /// Tag store whose analog reads hang for `delay`.
    struct StalledTags {
        inner: Arc<MemoryTagSource>,
        delay: Duration,
    }

    #[async_trait]
    impl TagSource for StalledTags {
        async fn read_analog(&self, pin: Pin) -> Option<f64> {
            tokio::time::sleep(self.delay).await;
            self.inner.read_analog(pin).await
        }

        async fn read_digital_output(&self, pin: Pin) -> Option<bool> {
            self.inner.read_digital_output(pin).await
        }

        async fn write_digital_output(&self, pin: Pin, value: bool) -> Result<(), SyncError> {
            self.inner.write_digital_output(pin, value).await
        }

        async fn read_tag(&self, name: &str, owner: &str) -> Option<TagValue> {
            self.inner.read_tag(name, owner).await
        }
    }

    const PINS: ValvePins = ValvePins {
        start_button: 3,
        stop_button: 4,
        valve_output: 5,
    };

    const CONFIG: &str = r#"
        [controllers]
        pumps = ["pump-1", "pump-2"]
        solar = ["solar-1", "solar-2"]
        tank_level = "tank"
        flow_sensor = "flow"
        pressure_sensor = "pressure"

        [pins]
        pump1_selector = 0
        pump2_selector = 1
        start_button = 3
        stop_button = 4
        valve_output = 5
    "#;

    struct Rig {
        tags: Arc<MemoryTagSource>,
        broadcaster: Arc<SnapshotBroadcaster>,
        driver: TickDriver,
    }

    fn rig() -> Rig {
        let config = SkidConfig::from_toml_str(CONFIG).unwrap();
        let tags = Arc::new(MemoryTagSource::new());
        let broadcaster = Arc::new(SnapshotBroadcaster::new(64));
        let interlock = Arc::new(ValveInterlock::new(
            tags.clone(),
            broadcaster.clone(),
            PINS,
            config.controllers.pumps.clone(),
        ));
        let driver = TickDriver::new(&config, tags.clone(), interlock);
        Rig {
            tags,
            broadcaster,
            driver,
        }
    }

    #[tokio::test]
    async fn tick_merges_every_family() {
        let rig = rig();
        rig.tags.set_analog(0, 2.0);
        rig.tags.set_analog(1, 1.0);
        rig.tags.set_output(5, false);
        rig.tags.set_tag("pump-1", pump_tags::APP_STATE, "auto");
        rig.tags.set_tag("pump-2", pump_tags::APP_STATE, "tank_level_low_low_level");
        rig.tags.set_tag("pump-1", pump_tags::FLOW_RATE, 12.5);
        rig.tags.set_tag("pump-1", pump_tags::STATE_STRING, "Running");
        rig.tags.set_tag("solar-1", "b_voltage", 24.0);
        rig.tags.set_tag("solar-2", "b_voltage", 26.0);
        rig.tags.set_tag("solar-1", "remaining_ah", 40.0);
        rig.tags.set_tag("solar-2", "remaining_ah", 60.0);
        rig.tags.set_tag("tank", "level_reading", 1.25);
        rig.tags.set_tag("pressure", "value", 3.5);

        let snapshot = rig.driver.tick().await;
        assert_eq!(snapshot.selector_state, SelectorState::BothLocal);
        assert!(!snapshot.valve_state);
        assert!(snapshot.faults.low_low_tank_level);
        assert!(!snapshot.faults.high_high_pressure);
        assert_eq!(snapshot.system_status, RUNNING);
        assert!((snapshot.pump.flow_rate - 12.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.pump.state, "Running");
        assert!((snapshot.solar.battery_voltage - 25.0).abs() < 1e-9);
        assert!((snapshot.solar.battery_ah - 100.0).abs() < 1e-9);
        assert!((snapshot.tank.level_mm - 1250.0).abs() < 1e-9);
        assert!((snapshot.skid.pressure - 3.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn one_data_update_per_tick() {
        let rig = rig();
        let mut viewer = rig.broadcaster.subscribe();
        viewer.try_recv().unwrap();
        rig.tags.set_analog(0, 1.0);
        rig.tags.set_analog(1, 1.0);
        rig.tags.set_output(5, false);

        let snapshot = rig.driver.tick().await;
        let mut updates = Vec::new();
        while let Some(event) = viewer.try_recv() {
            if let DisplayEvent::DataUpdate(update) = event {
                updates.push(update);
            }
        }
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].version, snapshot.version);
        assert!(!updates[0].valve_state);
        assert_eq!(updates[0].selector_state, SelectorState::BothLocal);
    }

    #[tokio::test]
    async fn stalled_tag_reads_do_not_hold_back_heartbeats() {
        let config = SkidConfig::from_toml_str(CONFIG).unwrap();
        let memory = Arc::new(MemoryTagSource::new());
        memory.set_analog(0, 1.0);
        memory.set_analog(1, 1.0);
        let broadcaster = Arc::new(SnapshotBroadcaster::new(64));
        let interlock = Arc::new(ValveInterlock::new(
            memory.clone(),
            broadcaster.clone(),
            PINS,
            config.controllers.pumps.clone(),
        ));
        let stalled = Arc::new(StalledTags {
            inner: memory,
            delay: Duration::from_secs(2),
        });
        let driver = Arc::new(TickDriver::new(&config, stalled, interlock));
        let mut viewer = broadcaster.subscribe();
        viewer.try_recv().unwrap();

        let (stop, shutdown) = watch::channel(false);
        let ticker = {
            let driver = Arc::clone(&driver);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { driver.run(Duration::from_millis(10), shutdown).await })
        };
        let heartbeat = spawn_heartbeat(broadcaster.clone(), Duration::from_millis(20), shutdown);

        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        let mut heartbeats = 0;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, viewer.recv()).await {
            if matches!(event, DisplayEvent::Heartbeat { .. }) {
                heartbeats += 1;
            }
        }
        assert!(heartbeats >= 5, "only {heartbeats} heartbeats while a tick was stalled");
        assert_eq!(broadcaster.snapshot().version, 0);

        ticker.abort();
        drop(stop);
        heartbeat.await.unwrap();
    }

    #[tokio::test]
    async fn unreadable_inputs_keep_previous_values() {
        let rig = rig();
        rig.tags.set_analog(0, 2.0);
        rig.tags.set_analog(1, 9.0);
        rig.tags.set_tag("pump-1", pump_tags::APP_STATE, "auto");
        rig.driver.tick().await;

        rig.tags.clear_analog(1);
        rig.tags.clear_tag("pump-1", pump_tags::APP_STATE);
        let snapshot = rig.driver.tick().await;
        assert_eq!(snapshot.selector_state, SelectorState::Pump2Local);
        assert_eq!(snapshot.system_status, RUNNING);
    }

    #[tokio::test]
    async fn standby_when_no_pump_in_auto() {
        let rig = rig();
        rig.tags.set_tag("pump-1", pump_tags::APP_STATE, "standby");
        rig.tags.set_tag("pump-2", pump_tags::APP_STATE, "calibration");
        let snapshot = rig.driver.tick().await;
        assert_eq!(snapshot.system_status, STANDBY);
        assert!(!snapshot.faults.any());
    }

    #[tokio::test]
    async fn faults_clear_on_the_next_tick() {
        let rig = rig();
        rig.tags
            .set_tag("pump-1", pump_tags::APP_STATE, "pressure_high_high_level");
        assert!(rig.driver.tick().await.faults.high_high_pressure);
        rig.tags.set_tag("pump-1", pump_tags::APP_STATE, "auto");
        assert!(!rig.driver.tick().await.faults.high_high_pressure);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let rig = rig();
        rig.tags.set_analog(0, 9.0);
        rig.tags.set_analog(1, 9.0);
        let driver = Arc::new(rig.driver);
        let (stop, shutdown) = watch::channel(false);
        let task = {
            let driver = Arc::clone(&driver);
            tokio::spawn(async move { driver.run(Duration::from_millis(5), shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        stop.send(true).unwrap();
        task.await.unwrap();
        let version = rig.broadcaster.snapshot().version;
        assert!(version >= 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rig.broadcaster.snapshot().version, version);
    }

    #[tokio::test]
    async fn heartbeat_reaches_viewers_until_shutdown() {
        let broadcaster = Arc::new(SnapshotBroadcaster::new(8));
        let mut viewer = broadcaster.subscribe();
        assert!(matches!(viewer.recv().await, Some(DisplayEvent::DataUpdate(_))));

        let (stop, shutdown) = watch::channel(false);
        let task = spawn_heartbeat(broadcaster.clone(), Duration::from_millis(5), shutdown);
        let event = tokio::time::timeout(Duration::from_secs(1), viewer.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(DisplayEvent::Heartbeat { .. })));
        drop(stop);
        task.await.unwrap();
        assert_eq!(broadcaster.snapshot().version, 0);
    }
}
