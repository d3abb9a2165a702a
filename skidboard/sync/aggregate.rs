use std::sync::Arc;

use crate::{
    snapshot::{PumpUpdate, SkidUpdate, SolarUpdate, TankUpdate},
    tags::{ControllerId, TagSource},
};

/// Tag names published by pump controllers.
pub mod pump_tags {
    /// Commanded rate.
    pub const TARGET_RATE: &str = "TargetRate";
    /// Measured rate.
    pub const FLOW_RATE: &str = "FlowRate";
    /// Display state string.
    pub const STATE_STRING: &str = "StateString";
    /// Operating state used by the interlock and fault evaluation.
    pub const APP_STATE: &str = "AppState";
}

/// Tank level sensor tag, in metres.
pub const TANK_LEVEL_TAG: &str = "level_reading";
/// Tank fill percentage tag.
pub const TANK_PERCENT_TAG: &str = "level_filled_percentage";
/// Single-value sensor tag (flow and pressure sensors).
pub const SENSOR_VALUE_TAG: &str = "value";
/// Millimetres per metre; tank sensors report metres.
pub const TANK_MM_PER_SOURCE_UNIT: f64 = 1_000.0;

/// How pooled readings of one field combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Arithmetic mean; for intensive quantities.
    Mean,
    /// Sum; for additive quantities.
    Sum,
}

impl Reduction {
    /// Reduces the readings, or `None` when there are none.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn reduce(self, readings: &[f64]) -> Option<f64> {
        if readings.is_empty() {
            return None;
        }
        let total: f64 = readings.iter().sum();
        Some(match self {
            Self::Sum => total,
            Self::Mean => total / readings.len() as f64,
        })
    }
}

/// Fields reported by every solar charge controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolarField {
    /// Battery voltage.
    BatteryVoltage,
    /// State of charge.
    BatteryPercentage,
    /// Panel power.
    PanelPower,
    /// Remaining capacity.
    BatteryAh,
}

impl SolarField {
    /// All fields in report order.
    pub const ALL: [Self; 4] = [
        Self::BatteryVoltage,
        Self::BatteryPercentage,
        Self::PanelPower,
        Self::BatteryAh,
    ];

    /// Tag published by the controller.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::BatteryVoltage => "b_voltage",
            Self::BatteryPercentage => "b_percent",
            Self::PanelPower => "panel_power",
            Self::BatteryAh => "remaining_ah",
        }
    }

    /// Pool reduction, fixed by the physical quantity: capacity adds up across banks,
    /// everything else is averaged.
    #[must_use]
    pub const fn reduction(self) -> Reduction {
        match self {
            Self::BatteryAh => Reduction::Sum,
            Self::BatteryVoltage | Self::BatteryPercentage | Self::PanelPower => Reduction::Mean,
        }
    }
}

/// Readings from one solar controller; `None` for tags it did not report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SolarReading {
    /// Battery voltage.
    pub battery_voltage: Option<f64>,
    /// State of charge.
    pub battery_percentage: Option<f64>,
    /// Panel power.
    pub panel_power: Option<f64>,
    /// Remaining capacity.
    pub battery_ah: Option<f64>,
}

impl SolarReading {
    const fn get(&self, field: SolarField) -> Option<f64> {
        match field {
            SolarField::BatteryVoltage => self.battery_voltage,
            SolarField::BatteryPercentage => self.battery_percentage,
            SolarField::PanelPower => self.panel_power,
            SolarField::BatteryAh => self.battery_ah,
        }
    }
}

/// Reduces a pool of solar readings. Returns `None` when no member reported anything.
#[must_use]
pub fn reduce_solar(pool: &[SolarReading]) -> Option<SolarUpdate> {
    let field = |field: SolarField| {
        let readings: Vec<f64> = pool.iter().filter_map(|r| r.get(field)).collect();
        field.reduction().reduce(&readings)
    };
    let update = SolarUpdate {
        battery_voltage: field(SolarField::BatteryVoltage),
        battery_percentage: field(SolarField::BatteryPercentage),
        panel_power: field(SolarField::PanelPower),
        battery_ah: field(SolarField::BatteryAh),
    };
    Some(update).filter(|u| !u.is_empty())
}

/// One tick's worth of pooled telemetry. Sections with no readings are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateResult {
    /// Primary pump.
    pub pump: Option<PumpUpdate>,
    /// Secondary pump; `None` when not configured or silent.
    pub pump2: Option<PumpUpdate>,
    /// Solar pool.
    pub solar: Option<SolarUpdate>,
    /// Tank.
    pub tank: Option<TankUpdate>,
    /// Skid sensors.
    pub skid: Option<SkidUpdate>,
}

/// Reads every configured peer controller and reduces the readings.
pub struct TelemetryAggregator {
    tags: Arc<dyn TagSource>,
    pumps: Vec<ControllerId>,
    solar: Vec<ControllerId>,
    tank_level: Option<ControllerId>,
    flow_sensor: Option<ControllerId>,
    pressure_sensor: Option<ControllerId>,
}

impl TelemetryAggregator {
    /// Aggregator over the given pump controllers (primary first) and nothing else.
    #[must_use]
    pub fn new(tags: Arc<dyn TagSource>, pumps: Vec<ControllerId>) -> Self {
        Self {
            tags,
            pumps,
            solar: Vec::new(),
            tank_level: None,
            flow_sensor: None,
            pressure_sensor: None,
        }
    }

    /// Sets the solar pool.
    #[must_use]
    pub fn solar_pool(mut self, pool: Vec<ControllerId>) -> Self {
        self.solar = pool;
        self
    }

    /// Sets the tank level sensor.
    #[must_use]
    pub fn tank_level(mut self, controller: Option<ControllerId>) -> Self {
        self.tank_level = controller;
        self
    }

    /// Sets the skid flow and pressure sensors.
    #[must_use]
    pub fn skid_sensors(
        mut self,
        flow: Option<ControllerId>,
        pressure: Option<ControllerId>,
    ) -> Self {
        self.flow_sensor = flow;
        self.pressure_sensor = pressure;
        self
    }

    /// Reads and reduces every family.
    pub async fn aggregate(&self) -> AggregateResult {
        AggregateResult {
            pump: match self.pumps.first() {
                Some(id) => self.pump(id).await,
                None => None,
            },
            pump2: match self.pumps.get(1) {
                Some(id) => self.pump(id).await,
                None => None,
            },
            solar: self.solar().await,
            tank: self.tank().await,
            skid: self.skid().await,
        }
    }

    /// Copies one pump controller's readings through unchanged.
    pub async fn pump(&self, controller: &str) -> Option<PumpUpdate> {
        let update = PumpUpdate {
            target_rate: self.number(pump_tags::TARGET_RATE, controller).await,
            flow_rate: self.number(pump_tags::FLOW_RATE, controller).await,
            state: self.text(pump_tags::STATE_STRING, controller).await,
        };
        Some(update).filter(|u| !u.is_empty())
    }

    /// Reads the solar pool and reduces it.
    pub async fn solar(&self) -> Option<SolarUpdate> {
        let mut pool = Vec::with_capacity(self.solar.len());
        for controller in &self.solar {
            let mut reading = SolarReading::default();
            for field in SolarField::ALL {
                let value = self.number(field.tag(), controller).await;
                match field {
                    SolarField::BatteryVoltage => reading.battery_voltage = value,
                    SolarField::BatteryPercentage => reading.battery_percentage = value,
                    SolarField::PanelPower => reading.panel_power = value,
                    SolarField::BatteryAh => reading.battery_ah = value,
                }
            }
            pool.push(reading);
        }
        reduce_solar(&pool)
    }

    /// Reads the tank sensor, converting metres to millimetres.
    pub async fn tank(&self) -> Option<TankUpdate> {
        let controller = self.tank_level.as_deref()?;
        let update = TankUpdate {
            level_mm: self
                .number(TANK_LEVEL_TAG, controller)
                .await
                .map(|metres| metres * TANK_MM_PER_SOURCE_UNIT),
            level_percent: self.number(TANK_PERCENT_TAG, controller).await,
        };
        Some(update).filter(|u| !u.is_empty())
    }

    /// Reads the skid flow and pressure sensors.
    pub async fn skid(&self) -> Option<SkidUpdate> {
        let flow = match self.flow_sensor.as_deref() {
            Some(controller) => self.number(SENSOR_VALUE_TAG, controller).await,
            None => None,
        };
        let pressure = match self.pressure_sensor.as_deref() {
            Some(controller) => self.number(SENSOR_VALUE_TAG, controller).await,
            None => None,
        };
        Some(SkidUpdate { flow, pressure }).filter(|u| !u.is_empty())
    }

    async fn number(&self, tag: &str, controller: &str) -> Option<f64> {
        self.tags
            .read_tag(tag, controller)
            .await
            .and_then(|value| value.as_f64())
            .filter(|value| value.is_finite())
    }

    async fn text(&self, tag: &str, controller: &str) -> Option<String> {
        self.tags
            .read_tag(tag, controller)
            .await
            .and_then(|value| value.as_str().map(str::to_owned))
    }
}
