use std::{fs, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::{
    selector::DEFAULT_SELECTOR_THRESHOLD,
    tags::{ControllerId, Pin},
};

/// Site configuration loaded from TOML.
///
/// ```toml
/// [site]
/// name = "north-skid"
///
/// [controllers]
/// pumps = ["pump-1", "pump-2"]
/// solar = ["solar-a", "solar-b"]
/// tank_level = "tank-1"
///
/// [pins]
/// pump1_selector = 1
/// pump2_selector = 2
/// start_button = 3
/// stop_button = 4
/// valve_output = 5
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SkidConfig {
    /// Site identity.
    #[serde(default)]
    pub site: SiteSettings,
    /// Peer controllers polled each tick.
    pub controllers: ControllerSettings,
    /// Physical pins.
    pub pins: PinSettings,
    /// Selector calibration.
    #[serde(default)]
    pub selector: SelectorSettings,
    /// Tick and heartbeat periods.
    #[serde(default)]
    pub timing: TimingSettings,
    /// Viewer delivery settings.
    #[serde(default)]
    pub broadcast: BroadcastSettings,
}

impl SkidConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading skid config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self.controllers.pumps.len() {
            0 => bail!("at least one pump controller is required"),
            1 | 2 => {}
            n => bail!("at most two pump controllers are supported, got {n}"),
        }
        if self.controllers.pumps.iter().any(String::is_empty) {
            bail!("pump controller ids must not be empty");
        }
        if self.pins.start_button == self.pins.stop_button {
            bail!("start and stop buttons share pin {}", self.pins.start_button);
        }
        if !self.selector.threshold.is_finite() {
            bail!("selector threshold must be finite");
        }
        if self.timing.tick_ms == 0 || self.timing.heartbeat_ms == 0 {
            bail!("tick and heartbeat periods must be positive");
        }
        if self.broadcast.subscriber_queue == 0 {
            bail!("subscriber queue must hold at least one event");
        }
        Ok(())
    }

    /// Primary pump controller. `None` only for a configuration that skipped validation.
    #[must_use]
    pub fn primary_pump(&self) -> Option<&str> {
        self.controllers.pumps.first().map(String::as_str)
    }

    /// Secondary pump controller, if configured.
    #[must_use]
    pub fn secondary_pump(&self) -> Option<&str> {
        self.controllers.pumps.get(1).map(String::as_str)
    }
}

/// Site identity.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteSettings {
    /// Name used as the event source.
    #[serde(default = "default_site_name")]
    pub name: String,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            name: default_site_name(),
        }
    }
}

/// Peer controller ids. Every pool may be empty.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerSettings {
    /// Pump controllers, primary first.
    pub pumps: Vec<ControllerId>,
    /// Solar charge controllers.
    #[serde(default)]
    pub solar: Vec<ControllerId>,
    /// Tank level sensor application.
    #[serde(default)]
    pub tank_level: Option<ControllerId>,
    /// Skid flow sensor application.
    #[serde(default)]
    pub flow_sensor: Option<ControllerId>,
    /// Skid pressure sensor application.
    #[serde(default)]
    pub pressure_sensor: Option<ControllerId>,
}

/// Pins resolved from the deployment configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PinSettings {
    /// Analog sense input of the pump 1 selector.
    pub pump1_selector: Pin,
    /// Analog sense input of the pump 2 selector.
    pub pump2_selector: Pin,
    /// Start button digital input.
    pub start_button: Pin,
    /// Stop button digital input.
    pub stop_button: Pin,
    /// Valve digital output.
    pub valve_output: Pin,
}

/// Selector calibration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SelectorSettings {
    /// Readings below this value mean the selector is in local mode.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

/// Periods in milliseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimingSettings {
    /// Poll period.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Heartbeat period.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

impl TimingSettings {
    /// Poll period.
    #[must_use]
    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Heartbeat period.
    #[must_use]
    pub const fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

/// Viewer delivery.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BroadcastSettings {
    /// Events a viewer may have queued before it is disconnected.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

fn default_site_name() -> String {
    "skid".into()
}

const fn default_threshold() -> f64 {
    DEFAULT_SELECTOR_THRESHOLD
}

const fn default_tick_ms() -> u64 {
    500
}

const fn default_heartbeat_ms() -> u64 {
    1_000
}

const fn default_subscriber_queue() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MINIMAL: &str = r#"
[controllers]
pumps = ["pump-1"]

[pins]
pump1_selector = 1
pump2_selector = 2
start_button = 3
stop_button = 4
valve_output = 5
"#;

    #[test]
    fn applies_defaults() {
        let config = SkidConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.site.name, "skid");
        assert_eq!(config.primary_pump(), Some("pump-1"));
        assert!(config.secondary_pump().is_none());
        assert!(config.controllers.solar.is_empty());
        assert!((config.selector.threshold - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.timing.tick(), Duration::from_millis(500));
        assert_eq!(config.timing.heartbeat(), Duration::from_secs(1));
        assert_eq!(config.broadcast.subscriber_queue, 32);
    }

    #[test]
    fn unvalidated_config_without_pumps_has_no_primary() {
        let raw = MINIMAL.replace(r#"pumps = ["pump-1"]"#, "pumps = []");
        let config: SkidConfig = toml::from_str(&raw).unwrap();
        assert_eq!(config.primary_pump(), None);
        assert!(config.secondary_pump().is_none());
        assert!(SkidConfig::from_toml_str(&raw).is_err());
    }

    #[test]
    fn loads_full_document_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("skid.toml");
        fs::write(
            &path,
            r#"
[site]
name = "north"

[controllers]
pumps = ["pump-1", "pump-2"]
solar = ["solar-a", "solar-b"]
tank_level = "tank"
flow_sensor = "flow"
pressure_sensor = "pressure"

[pins]
pump1_selector = 1
pump2_selector = 2
start_button = 3
stop_button = 4
valve_output = 5

[selector]
threshold = 4.5

[timing]
tick_ms = 250
"#,
        )
        .unwrap();
        let config = SkidConfig::load(&path).unwrap();
        assert_eq!(config.secondary_pump(), Some("pump-2"));
        assert_eq!(config.controllers.solar.len(), 2);
        assert_eq!(config.controllers.tank_level.as_deref(), Some("tank"));
        assert_eq!(config.timing.tick_ms, 250);
        assert_eq!(config.timing.heartbeat_ms, 1_000);
    }

    #[test]
    fn rejects_missing_or_extra_pumps() {
        let none = MINIMAL.replace(r#"pumps = ["pump-1"]"#, "pumps = []");
        assert!(SkidConfig::from_toml_str(&none).is_err());
        let three = MINIMAL.replace(r#"pumps = ["pump-1"]"#, r#"pumps = ["a", "b", "c"]"#);
        assert!(SkidConfig::from_toml_str(&three).is_err());
    }

    #[test]
    fn rejects_zero_periods_and_queue() {
        let zero_tick = format!("{MINIMAL}\n[timing]\ntick_ms = 0\n");
        assert!(SkidConfig::from_toml_str(&zero_tick).is_err());
        let zero_queue = format!("{MINIMAL}\n[broadcast]\nsubscriber_queue = 0\n");
        assert!(SkidConfig::from_toml_str(&zero_queue).is_err());
    }

    #[test]
    fn rejects_shared_button_pins() {
        let shared = MINIMAL.replace("stop_button = 4", "stop_button = 3");
        assert!(SkidConfig::from_toml_str(&shared).is_err());
    }
}
