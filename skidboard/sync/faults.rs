use serde::{Deserialize, Serialize};

/// Peer state reported while the tank is at its low-low limit.
pub const LOW_LOW_TANK_STATE: &str = "tank_level_low_low_level";

/// Peer state reported while discharge pressure is at its high-high limit.
pub const HIGH_HIGH_PRESSURE_STATE: &str = "pressure_high_high_level";

/// Fault flags shown on the dashboard. Recomputed every tick, never latched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultFlags {
    /// Either pump controller reports low-low tank level.
    pub low_low_tank_level: bool,
    /// Either pump controller reports high-high pressure.
    pub high_high_pressure: bool,
}

impl FaultFlags {
    /// Whether any fault is active.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.low_low_tank_level || self.high_high_pressure
    }
}

/// Evaluates faults from the two pump controllers' operating states.
#[must_use]
pub fn evaluate(pump1_state: &str, pump2_state: &str) -> FaultFlags {
    evaluate_peers([Some(pump1_state), Some(pump2_state)])
}

/// Evaluates faults over any number of peer states; missing states match nothing.
#[must_use]
pub fn evaluate_peers<'a, I>(states: I) -> FaultFlags
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    states
        .into_iter()
        .flatten()
        .fold(FaultFlags::default(), |flags, state| FaultFlags {
            low_low_tank_level: flags.low_low_tank_level || state == LOW_LOW_TANK_STATE,
            high_high_pressure: flags.high_high_pressure || state == HIGH_HIGH_PRESSURE_STATE,
        })
}
