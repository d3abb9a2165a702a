use std::{fmt, sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::json;
use shared_logging::LogLevel;
use tokio::sync::Mutex;

use crate::{
    aggregate::pump_tags,
    broadcast::{Advisory, SnapshotBroadcaster},
    error::SyncError,
    selector::SelectorState,
    snapshot::{PartialUpdate, Snapshot},
    tags::{ControllerId, Pin, TagSource, TagValue},
    telemetry::SyncTelemetry,
};

/// Peer operating state during which the valve must not be moved by hand.
pub const CALIBRATION_STATE: &str = "calibration";

/// Direction of a digital input edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgePolarity {
    /// Low to high.
    Rising,
    /// High to low.
    Falling,
}

/// Debounced edge as delivered by the pulse listener. Only `pin` and `polarity` are
/// acted upon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ButtonEdge {
    /// Originating digital input.
    pub pin: Pin,
    /// Input level after the edge.
    pub value: bool,
    /// Time since the previous edge on this input.
    pub elapsed: Duration,
    /// Edge counter maintained by the listener.
    pub counter: u64,
    /// Edge direction.
    pub polarity: EdgePolarity,
}

impl ButtonEdge {
    /// A rising edge on `pin`, as produced by a button press.
    #[must_use]
    pub const fn press(pin: Pin) -> Self {
        Self {
            pin,
            value: true,
            elapsed: Duration::ZERO,
            counter: 0,
            polarity: EdgePolarity::Rising,
        }
    }
}

/// Valve movement requested by a button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveCommand {
    /// Start button.
    Open,
    /// Stop button.
    Close,
}

impl ValveCommand {
    /// Output level written for the command (`false` = 0 = open).
    #[must_use]
    pub const fn output(self) -> bool {
        matches!(self, Self::Close)
    }
}

impl fmt::Display for ValveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Result of one button edge.
#[derive(Debug, Clone, PartialEq)]
pub enum InterlockOutcome {
    /// Manual control is not authorized in this selector position.
    NotAuthorized(SelectorState),
    /// Edge was not a rising edge on a start or stop input.
    Ignored(ButtonEdge),
    /// A peer is calibrating; an advisory was raised instead of moving the valve.
    Advisory(Advisory),
    /// The output was written. `confirmed` is the read-back, if one was available.
    Actuated {
        /// Requested movement.
        command: ValveCommand,
        /// Output level read back after the write.
        confirmed: Option<bool>,
    },
    /// The write failed or did not take effect. Not retried.
    Failed {
        /// Requested movement.
        command: ValveCommand,
        /// What went wrong.
        error: SyncError,
    },
}

/// Input and output pins of the manual valve station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValvePins {
    /// Start (open) button.
    pub start_button: Pin,
    /// Stop (close) button.
    pub stop_button: Pin,
    /// Valve output.
    pub valve_output: Pin,
}

/// Gates the manual valve buttons against the selector position and peer states.
///
/// Presses are serialized; each press writes the output at most once. The valve state
/// published to the snapshot always comes from reading the output back.
pub struct ValveInterlock {
    tags: Arc<dyn TagSource>,
    broadcaster: Arc<SnapshotBroadcaster>,
    pins: ValvePins,
    peers: Vec<ControllerId>,
    confirmed: Mutex<Option<bool>>,
    telemetry: SyncTelemetry,
}

impl fmt::Debug for ValveInterlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValveInterlock")
            .field("pins", &self.pins)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

impl ValveInterlock {
    /// Creates the interlock. `peers` are the pump controllers whose state is checked.
    #[must_use]
    pub fn new(
        tags: Arc<dyn TagSource>,
        broadcaster: Arc<SnapshotBroadcaster>,
        pins: ValvePins,
        peers: Vec<ControllerId>,
    ) -> Self {
        Self {
            tags,
            broadcaster,
            pins,
            peers,
            confirmed: Mutex::new(None),
            telemetry: SyncTelemetry::disabled("interlock"),
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: SyncTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Pins in use.
    #[must_use]
    pub const fn pins(&self) -> ValvePins {
        self.pins
    }

    /// Last confirmed output level.
    pub async fn confirmed(&self) -> Option<bool> {
        *self.confirmed.lock().await
    }

    /// Routes an edge to the start or stop handler.
    pub async fn handle_edge(&self, edge: ButtonEdge) -> InterlockOutcome {
        if edge.polarity != EdgePolarity::Rising {
            return InterlockOutcome::Ignored(edge);
        }
        if edge.pin == self.pins.start_button {
            self.on_start_edge(edge).await
        } else if edge.pin == self.pins.stop_button {
            self.on_stop_edge(edge).await
        } else {
            InterlockOutcome::Ignored(edge)
        }
    }

    /// Start button pressed: open the valve if allowed.
    pub async fn on_start_edge(&self, edge: ButtonEdge) -> InterlockOutcome {
        self.press(ValveCommand::Open, edge).await
    }

    /// Stop button pressed: close the valve if allowed.
    pub async fn on_stop_edge(&self, edge: ButtonEdge) -> InterlockOutcome {
        self.press(ValveCommand::Close, edge).await
    }

    /// Reads the valve output into `update` and merges it as one version. Holds the press
    /// lock across the read and the merge, so a concurrent press cannot be overwritten by
    /// a stale reading.
    pub async fn merge_with_valve_state(&self, update: PartialUpdate) -> Arc<Snapshot> {
        let mut confirmed = self.confirmed.lock().await;
        let update = match self.tags.read_digital_output(self.pins.valve_output).await {
            Some(level) => {
                *confirmed = Some(level);
                update.with_valve_state(level)
            }
            None => update,
        };
        self.broadcaster.merge(&update)
    }

    async fn press(&self, command: ValveCommand, edge: ButtonEdge) -> InterlockOutcome {
        let mut confirmed = self.confirmed.lock().await;

        let selector = self.broadcaster.latest().selector_state;
        if !selector.allows_manual_valve() {
            self.telemetry.log(
                LogLevel::Debug,
                "valve.press_ignored",
                json!({ "command": command.to_string(), "selector": u8::from(selector) }),
            );
            return InterlockOutcome::NotAuthorized(selector);
        }

        let calibrating = self.calibrating_peers().await;
        if !calibrating.is_empty() {
            let advisory = Advisory {
                kind: "valve_interlock".into(),
                message: format!(
                    "Cannot {command} the valve while a pump controller is in calibration"
                ),
                peers: calibrating,
                raised_at: Utc::now(),
            };
            self.telemetry.log(
                LogLevel::Warn,
                "valve.interlocked",
                json!({ "command": command.to_string(), "peers": advisory.peers }),
            );
            self.broadcaster.advise(advisory.clone());
            return InterlockOutcome::Advisory(advisory);
        }

        self.telemetry.log(
            LogLevel::Info,
            "valve.press",
            json!({ "command": command.to_string(), "pin": edge.pin, "counter": edge.counter }),
        );
        let target = command.output();
        if let Err(error) = self
            .tags
            .write_digital_output(self.pins.valve_output, target)
            .await
        {
            self.report_failure(command, &error);
            return InterlockOutcome::Failed { command, error };
        }

        let observed = self.tags.read_digital_output(self.pins.valve_output).await;
        if let Some(level) = observed {
            self.confirm(&mut confirmed, level);
            if level != target {
                let error = SyncError::ReadBackMismatch {
                    pin: self.pins.valve_output,
                    commanded: target,
                    observed: level,
                };
                self.report_failure(command, &error);
                return InterlockOutcome::Failed { command, error };
            }
        }
        self.telemetry.log(
            LogLevel::Info,
            "valve.actuated",
            json!({ "command": command.to_string(), "confirmed": observed }),
        );
        self.telemetry.event(
            "skid.valve.actuated",
            json!({ "command": command.to_string(), "confirmed": observed }),
        );
        InterlockOutcome::Actuated {
            command,
            confirmed: observed,
        }
    }

    fn confirm(&self, confirmed: &mut Option<bool>, level: bool) {
        *confirmed = Some(level);
        if self.broadcaster.latest().valve_state != level {
            self.broadcaster
                .merge(&PartialUpdate::new().with_valve_state(level));
        }
    }

    async fn calibrating_peers(&self) -> Vec<(String, String)> {
        let mut calibrating = Vec::new();
        for peer in &self.peers {
            let state = self.tags.read_tag(pump_tags::APP_STATE, peer).await;
            if state.as_ref().and_then(TagValue::as_str) == Some(CALIBRATION_STATE) {
                calibrating.push((peer.clone(), CALIBRATION_STATE.to_owned()));
            }
        }
        calibrating
    }

    fn report_failure(&self, command: ValveCommand, error: &SyncError) {
        self.telemetry.log(
            LogLevel::Error,
            "valve.write_failed",
            json!({ "command": command.to_string(), "error": error.to_string() }),
        );
        self.telemetry.event(
            "skid.valve.write_failed",
            json!({ "command": command.to_string(), "error": error.to_string() }),
        );
    }
}
