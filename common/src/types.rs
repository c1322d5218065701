use serde::{Deserialize, Serialize};

use crate::program::Program;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegulatorState {
    Idle,
    Cooling,
    Heating,
    Satisfied,
}

impl RegulatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Cooling => "COOLING",
            Self::Heating => "HEATING",
            Self::Satisfied => "SATISFIED",
        }
    }
}

/// Relay transition requested by the regulator. Relay one drives the cooler,
/// relay two the heater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    CoolerOn,
    CoolerOff,
    HeaterOn,
    HeaterOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relay {
    Cooler,
    Heater,
}

impl RelayAction {
    pub fn relay(self) -> Relay {
        match self {
            Self::CoolerOn | Self::CoolerOff => Relay::Cooler,
            Self::HeaterOn | Self::HeaterOff => Relay::Heater,
        }
    }

    pub fn energize(self) -> bool {
        matches!(self, Self::CoolerOn | Self::HeaterOn)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegulatorStatus {
    pub program: Program,
    #[serde(rename = "programFlag")]
    pub program_flag: char,
    #[serde(rename = "minTemp")]
    pub min_temp: f32,
    #[serde(rename = "maxTemp")]
    pub max_temp: f32,
    #[serde(rename = "currentTemp")]
    pub current_temp: Option<f32>,
    pub state: &'static str,
    #[serde(rename = "coolerOn")]
    pub cooler_on: bool,
    #[serde(rename = "heaterOn")]
    pub heater_on: bool,
    #[serde(rename = "sensorValid")]
    pub sensor_valid: bool,
    #[serde(rename = "readingAgeMs")]
    pub reading_age_ms: Option<u64>,
    #[serde(rename = "cycleLockRemainingMs")]
    pub cycle_lock_remaining_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegulatorStatePayload {
    pub program: char,
    pub temp: Option<f32>,
    pub min: f32,
    pub max: f32,
    pub state: &'static str,
    pub cooler: bool,
    pub heater: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}
