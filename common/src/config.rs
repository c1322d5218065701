use serde::{Deserialize, Serialize};

use crate::program::{ProgramTable, MAX_VALID_TEMP_C, MIN_VALID_TEMP_C};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulatorConfig {
    pub min_cycle_ms: u64,
    pub sensor_stale_timeout_ms: u64,
    pub state_publish_interval_ms: u64,
    pub alive_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub min_valid_temp_c: f32,
    pub max_valid_temp_c: f32,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            min_cycle_ms: 180_000,
            sensor_stale_timeout_ms: 300_000,
            state_publish_interval_ms: 10_000,
            alive_interval_ms: 60_000,
            reconnect_delay_ms: 2_000,
            min_valid_temp_c: MIN_VALID_TEMP_C,
            max_valid_temp_c: MAX_VALID_TEMP_C,
        }
    }
}

impl RegulatorConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if !self.min_valid_temp_c.is_finite() || !self.max_valid_temp_c.is_finite() {
            self.min_valid_temp_c = defaults.min_valid_temp_c;
            self.max_valid_temp_c = defaults.max_valid_temp_c;
        }
        if self.min_valid_temp_c >= self.max_valid_temp_c {
            self.min_valid_temp_c = defaults.min_valid_temp_c;
            self.max_valid_temp_c = defaults.max_valid_temp_c;
        }
        self.state_publish_interval_ms = self.state_publish_interval_ms.max(1_000);
        self.alive_interval_ms = self.alive_interval_ms.max(1_000);
        self.reconnect_delay_ms = self.reconnect_delay_ms.max(250);
    }

    pub fn is_valid_reading(&self, temp_c: f32) -> bool {
        temp_c.is_finite() && (self.min_valid_temp_c..=self.max_valid_temp_c).contains(&temp_c)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.2".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_client_id: "fermenter-controller".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    pub cooler_pin: i32,
    pub heater_pin: i32,
    pub active_low: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            cooler_pin: 12,
            heater_pin: 13,
            active_low: false,
        }
    }
}

impl RelayConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.cooler_pin < 0 {
            self.cooler_pin = defaults.cooler_pin;
        }
        if self.heater_pin < 0 {
            self.heater_pin = defaults.heater_pin;
        }
        if self.cooler_pin == self.heater_pin {
            self.cooler_pin = defaults.cooler_pin;
            self.heater_pin = defaults.heater_pin;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub program_file: String,
    pub event_log_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            program_file: "program.ini".to_string(),
            event_log_file: "events.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub regulator: RegulatorConfig,
    #[serde(default)]
    pub programs: ProgramTable,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub relays: RelayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.regulator.sanitize();
        self.programs.sanitize();
        self.relays.sanitize();
    }
}
