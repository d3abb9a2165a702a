use std::fmt;

use serde::{Deserialize, Serialize};

/// Site calibration: selector readings below this value mean "local".
pub const DEFAULT_SELECTOR_THRESHOLD: f64 = 5.0;

/// Combined position of the two pump selectors.
///
/// The numeric codes are what the display layer receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SelectorState {
    /// Both selectors in remote/pump mode.
    NeitherLocal = 0,
    /// Only the pump 2 selector reads local.
    Pump1Local = 1,
    /// Only the pump 1 selector reads local.
    Pump2Local = 2,
    /// Both selectors in local/valve mode; manual valve control is allowed.
    BothLocal = 3,
}

impl SelectorState {
    /// Whether the manual valve buttons are authorized.
    #[must_use]
    pub const fn allows_manual_valve(self) -> bool {
        matches!(self, Self::BothLocal)
    }
}

impl From<SelectorState> for u8 {
    fn from(state: SelectorState) -> Self {
        state as Self
    }
}

impl TryFrom<u8> for SelectorState {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::NeitherLocal),
            1 => Ok(Self::Pump1Local),
            2 => Ok(Self::Pump2Local),
            3 => Ok(Self::BothLocal),
            other => Err(format!("unknown selector state {other}")),
        }
    }
}

impl fmt::Display for SelectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeitherLocal => write!(f, "neither_local"),
            Self::Pump1Local => write!(f, "pump1_local"),
            Self::Pump2Local => write!(f, "pump2_local"),
            Self::BothLocal => write!(f, "both_local"),
        }
    }
}

/// Threshold comparator for the two redundant selector inputs.
///
/// Both branches use the strict comparison `reading < threshold`; a reading exactly at
/// the threshold is remote. `NaN` never compares below, so an unreadable sense value
/// counts as remote and the function stays total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorStateMachine {
    threshold: f64,
}

impl Default for SelectorStateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_SELECTOR_THRESHOLD)
    }
}

impl SelectorStateMachine {
    /// Creates a comparator with the given calibration threshold.
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Calibration threshold.
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Whether a single selector reading means local mode.
    #[must_use]
    pub fn is_local(&self, reading: f64) -> bool {
        reading < self.threshold
    }

    /// Derives the combined state from the latest pump 1 and pump 2 readings.
    #[must_use]
    pub fn derive(&self, pump1_reading: f64, pump2_reading: f64) -> SelectorState {
        match (self.is_local(pump1_reading), self.is_local(pump2_reading)) {
            (true, true) => SelectorState::BothLocal,
            (true, false) => SelectorState::Pump2Local,
            (false, true) => SelectorState::Pump1Local,
            (false, false) => SelectorState::NeitherLocal,
        }
    }
}
