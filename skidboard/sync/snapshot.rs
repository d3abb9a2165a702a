use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{faults::FaultFlags, selector::SelectorState};

/// Operating state shown before a controller has reported anything.
pub const STANDBY: &str = "standby";

/// Pump controller readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpTelemetry {
    /// Commanded rate.
    pub target_rate: f64,
    /// Measured rate.
    pub flow_rate: f64,
    /// Controller state string.
    pub state: String,
}

impl Default for PumpTelemetry {
    fn default() -> Self {
        Self {
            target_rate: 0.0,
            flow_rate: 0.0,
            state: STANDBY.into(),
        }
    }
}

/// Pooled solar readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SolarTelemetry {
    /// Mean battery voltage.
    pub battery_voltage: f64,
    /// Mean state of charge.
    pub battery_percentage: f64,
    /// Mean panel power.
    pub panel_power: f64,
    /// Total remaining capacity across banks.
    pub battery_ah: f64,
}

/// Tank level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TankTelemetry {
    /// Level in millimetres.
    pub level_mm: f64,
    /// Fill percentage.
    pub level_percent: f64,
}

/// Skid line sensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SkidTelemetry {
    /// Line flow.
    pub flow: f64,
    /// Line pressure.
    pub pressure: f64,
}

/// Authoritative, fully populated system record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Primary pump.
    pub pump: PumpTelemetry,
    /// Secondary pump.
    pub pump2: PumpTelemetry,
    /// Solar pool.
    pub solar: SolarTelemetry,
    /// Tank.
    pub tank: TankTelemetry,
    /// Skid sensors.
    pub skid: SkidTelemetry,
    /// Combined selector position.
    pub selector_state: SelectorState,
    /// Confirmed valve output: `false` = open (0), `true` = closed (1).
    pub valve_state: bool,
    /// Active faults.
    pub faults: FaultFlags,
    /// Overall status line.
    pub system_status: String,
    /// Time of the last merge.
    pub updated_at: DateTime<Utc>,
    /// Number of merges applied since startup.
    pub version: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            pump: PumpTelemetry::default(),
            pump2: PumpTelemetry::default(),
            solar: SolarTelemetry::default(),
            tank: TankTelemetry::default(),
            skid: SkidTelemetry::default(),
            selector_state: SelectorState::NeitherLocal,
            valve_state: true,
            faults: FaultFlags::default(),
            system_status: STANDBY.into(),
            updated_at: Utc::now(),
            version: 0,
        }
    }
}

impl Snapshot {
    /// Applies the fields present in `update`, then stamps the merge.
    pub(crate) fn apply(&mut self, update: &PartialUpdate, now: DateTime<Utc>) {
        if let Some(pump) = &update.pump {
            pump.apply_to(&mut self.pump);
        }
        if let Some(pump) = &update.pump2 {
            pump.apply_to(&mut self.pump2);
        }
        if let Some(solar) = &update.solar {
            solar.apply_to(&mut self.solar);
        }
        if let Some(tank) = &update.tank {
            set(&mut self.tank.level_mm, tank.level_mm);
            set(&mut self.tank.level_percent, tank.level_percent);
        }
        if let Some(skid) = &update.skid {
            set(&mut self.skid.flow, skid.flow);
            set(&mut self.skid.pressure, skid.pressure);
        }
        if let Some(state) = update.selector_state {
            self.selector_state = state;
        }
        if let Some(closed) = update.valve_state {
            self.valve_state = closed;
        }
        if let Some(faults) = update.faults {
            self.faults = faults;
        }
        if let Some(status) = &update.system_status {
            self.system_status.clone_from(status);
        }
        self.updated_at = now;
        self.version += 1;
    }
}

fn set<T: Copy>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// Fresh pump readings; absent fields keep their previous value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PumpUpdate {
    /// Commanded rate.
    pub target_rate: Option<f64>,
    /// Measured rate.
    pub flow_rate: Option<f64>,
    /// Controller state string.
    pub state: Option<String>,
}

impl PumpUpdate {
    /// Whether no field is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.target_rate.is_none() && self.flow_rate.is_none() && self.state.is_none()
    }

    fn apply_to(&self, pump: &mut PumpTelemetry) {
        set(&mut pump.target_rate, self.target_rate);
        set(&mut pump.flow_rate, self.flow_rate);
        if let Some(state) = &self.state {
            pump.state.clone_from(state);
        }
    }
}

/// Fresh solar aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SolarUpdate {
    /// Mean battery voltage.
    pub battery_voltage: Option<f64>,
    /// Mean state of charge.
    pub battery_percentage: Option<f64>,
    /// Mean panel power.
    pub panel_power: Option<f64>,
    /// Summed capacity.
    pub battery_ah: Option<f64>,
}

impl SolarUpdate {
    /// Whether no field is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.battery_voltage.is_none()
            && self.battery_percentage.is_none()
            && self.panel_power.is_none()
            && self.battery_ah.is_none()
    }

    fn apply_to(&self, solar: &mut SolarTelemetry) {
        set(&mut solar.battery_voltage, self.battery_voltage);
        set(&mut solar.battery_percentage, self.battery_percentage);
        set(&mut solar.panel_power, self.panel_power);
        set(&mut solar.battery_ah, self.battery_ah);
    }
}

/// Fresh tank readings, already in millimetres.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TankUpdate {
    /// Level in millimetres.
    pub level_mm: Option<f64>,
    /// Fill percentage.
    pub level_percent: Option<f64>,
}

impl TankUpdate {
    /// Whether no field is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.level_mm.is_none() && self.level_percent.is_none()
    }
}

/// Fresh skid sensor readings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SkidUpdate {
    /// Line flow.
    pub flow: Option<f64>,
    /// Line pressure.
    pub pressure: Option<f64>,
}

impl SkidUpdate {
    /// Whether no field is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.flow.is_none() && self.pressure.is_none()
    }
}

/// Sparse update from one producer. Only `Some` fields are merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialUpdate {
    /// Primary pump.
    pub pump: Option<PumpUpdate>,
    /// Secondary pump.
    pub pump2: Option<PumpUpdate>,
    /// Solar pool.
    pub solar: Option<SolarUpdate>,
    /// Tank.
    pub tank: Option<TankUpdate>,
    /// Skid sensors.
    pub skid: Option<SkidUpdate>,
    /// Selector position.
    pub selector_state: Option<SelectorState>,
    /// Confirmed valve output.
    pub valve_state: Option<bool>,
    /// Fault flags.
    pub faults: Option<FaultFlags>,
    /// Status line.
    pub system_status: Option<String>,
}

impl PartialUpdate {
    /// Empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the update carries nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pump.is_none()
            && self.pump2.is_none()
            && self.solar.is_none()
            && self.tank.is_none()
            && self.skid.is_none()
            && self.selector_state.is_none()
            && self.valve_state.is_none()
            && self.faults.is_none()
            && self.system_status.is_none()
    }

    /// Sets primary pump readings; an empty section is dropped.
    #[must_use]
    pub fn with_pump(mut self, pump: PumpUpdate) -> Self {
        self.pump = Some(pump).filter(|p| !p.is_empty());
        self
    }

    /// Sets secondary pump readings; an empty section is dropped.
    #[must_use]
    pub fn with_pump2(mut self, pump: PumpUpdate) -> Self {
        self.pump2 = Some(pump).filter(|p| !p.is_empty());
        self
    }

    /// Sets solar aggregates; an empty section is dropped.
    #[must_use]
    pub fn with_solar(mut self, solar: SolarUpdate) -> Self {
        self.solar = Some(solar).filter(|s| !s.is_empty());
        self
    }

    /// Sets tank readings; an empty section is dropped.
    #[must_use]
    pub fn with_tank(mut self, tank: TankUpdate) -> Self {
        self.tank = Some(tank).filter(|t| !t.is_empty());
        self
    }

    /// Sets skid readings; an empty section is dropped.
    #[must_use]
    pub fn with_skid(mut self, skid: SkidUpdate) -> Self {
        self.skid = Some(skid).filter(|s| !s.is_empty());
        self
    }

    /// Sets the selector position.
    #[must_use]
    pub const fn with_selector_state(mut self, state: SelectorState) -> Self {
        self.selector_state = Some(state);
        self
    }

    /// Sets the confirmed valve output.
    #[must_use]
    pub const fn with_valve_state(mut self, closed: bool) -> Self {
        self.valve_state = Some(closed);
        self
    }

    /// Sets the fault flags.
    #[must_use]
    pub const fn with_faults(mut self, faults: FaultFlags) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Sets the status line.
    #[must_use]
    pub fn with_system_status(mut self, status: impl Into<String>) -> Self {
        self.system_status = Some(status.into());
        self
    }
}
