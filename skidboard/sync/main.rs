use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    broadcast::{SnapshotBroadcaster, SubscriptionHandle},
    config::SkidConfig,
    driver::{spawn_heartbeat, TickDriver},
    interlock::{ButtonEdge, InterlockOutcome, ValveInterlock, ValvePins},
    snapshot::Snapshot,
    tags::TagSource,
    telemetry::SyncTelemetry,
};

/// Wired skid core: one broadcaster, one interlock and one tick driver over a tag source.
pub struct SkidRuntime {
    config: SkidConfig,
    broadcaster: Arc<SnapshotBroadcaster>,
    interlock: Arc<ValveInterlock>,
    driver: Arc<TickDriver>,
    telemetry: SyncTelemetry,
}

impl SkidRuntime {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> SkidRuntimeBuilder {
        SkidRuntimeBuilder::default()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &SkidConfig {
        &self.config
    }

    /// Snapshot owner.
    #[must_use]
    pub fn broadcaster(&self) -> Arc<SnapshotBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    /// Valve interlock.
    #[must_use]
    pub fn interlock(&self) -> Arc<ValveInterlock> {
        Arc::clone(&self.interlock)
    }

    /// Tick driver.
    #[must_use]
    pub fn driver(&self) -> Arc<TickDriver> {
        Arc::clone(&self.driver)
    }

    /// Telemetry handle.
    #[must_use]
    pub const fn telemetry(&self) -> &SyncTelemetry {
        &self.telemetry
    }

    /// Registers a viewer.
    pub fn subscribe(&self) -> SubscriptionHandle {
        self.broadcaster.subscribe()
    }

    /// Hands a button edge to the interlock.
    pub async fn handle_edge(&self, edge: ButtonEdge) -> InterlockOutcome {
        self.interlock.handle_edge(edge).await
    }

    /// Runs one tick, then spawns the tick and heartbeat tasks.
    pub async fn start(&self) -> RunningSkid {
        let first = self.driver.tick().await;

        let (shutdown, signal) = watch::channel(false);
        let timing = &self.config.timing;
        let driver = Arc::clone(&self.driver);
        let tick_period = timing.tick();
        let ticker_signal = signal.clone();
        let ticker = tokio::spawn(async move { driver.run(tick_period, ticker_signal).await });
        let heartbeat = spawn_heartbeat(self.broadcaster(), timing.heartbeat(), signal);

        self.telemetry.log(
            LogLevel::Info,
            "runtime.started",
            json!({
                "site": self.config.site.name,
                "version": first.version,
                "tick": format!("{:?}", timing.tick()),
                "heartbeat": format!("{:?}", timing.heartbeat()),
            }),
        );
        RunningSkid {
            shutdown,
            tasks: vec![ticker, heartbeat],
            telemetry: self.telemetry.clone(),
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.broadcaster.snapshot()
    }
}

/// Background tasks of a started runtime.
pub struct RunningSkid {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    telemetry: SyncTelemetry,
}

impl RunningSkid {
    /// Signals the tasks to stop and waits for them.
    pub async fn shutdown(self) -> Result<()> {
        // Receivers also stop when the sender is dropped, so a send error is harmless.
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await.context("joining skid task")?;
        }
        self.telemetry
            .log(LogLevel::Info, "runtime.stopped", json!({}));
        Ok(())
    }
}

/// Builder for `SkidRuntime`.
#[derive(Default)]
pub struct SkidRuntimeBuilder {
    config: Option<SkidConfig>,
    tags: Option<Arc<dyn TagSource>>,
    telemetry: Option<SyncTelemetry>,
    initial: Option<Snapshot>,
}

impl SkidRuntimeBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: SkidConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Loads the configuration from a TOML file.
    pub fn config_path(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let config = SkidConfig::load(path).context("loading skid configuration")?;
        self.config = Some(config);
        Ok(self)
    }

    /// Sets the tag source.
    #[must_use]
    pub fn tags(mut self, tags: Arc<dyn TagSource>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Sets telemetry. Each component logs under its own scope.
    #[must_use]
    pub fn telemetry(mut self, telemetry: SyncTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Starts from a snapshot other than the standby default.
    #[must_use]
    pub fn initial_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.initial = Some(snapshot);
        self
    }

    /// Builds runtime.
    pub fn build(self) -> Result<SkidRuntime> {
        let config = self.config.context("skid runtime requires a configuration")?;
        let tags = self.tags.context("skid runtime requires a tag source")?;
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| SyncTelemetry::disabled("skid"));

        let queue = config.broadcast.subscriber_queue;
        let broadcaster = Arc::new(
            SnapshotBroadcaster::with_snapshot(self.initial.unwrap_or_default(), queue)
                .with_telemetry(telemetry.scoped("broadcast")),
        );
        let pins = ValvePins {
            start_button: config.pins.start_button,
            stop_button: config.pins.stop_button,
            valve_output: config.pins.valve_output,
        };
        let interlock = Arc::new(
            ValveInterlock::new(
                Arc::clone(&tags),
                Arc::clone(&broadcaster),
                pins,
                config.controllers.pumps.clone(),
            )
            .with_telemetry(telemetry.scoped("interlock")),
        );
        let driver = Arc::new(
            TickDriver::new(&config, tags, Arc::clone(&interlock))
                .with_telemetry(telemetry.scoped("driver")),
        );
        Ok(SkidRuntime {
            config,
            broadcaster,
            interlock,
            driver,
            telemetry,
        })
    }
}
