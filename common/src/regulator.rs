use crate::{
    config::RegulatorConfig,
    program::{Program, ProgramTable, Thresholds},
    types::{Relay, RelayAction, RegulatorState, RegulatorStatePayload, RegulatorStatus},
};

#[derive(Debug, Clone)]
pub struct Regulator {
    pub config: RegulatorConfig,
    programs: ProgramTable,
    program: Program,

    state: RegulatorState,
    current_temp_c: Option<f32>,
    last_reading_ms: Option<u64>,

    cooler_on: bool,
    heater_on: bool,
    last_cooler_change_ms: Option<u64>,
    last_heater_change_ms: Option<u64>,
}

impl Regulator {
    pub fn new(config: RegulatorConfig, mut programs: ProgramTable, program: Program) -> Self {
        programs.sanitize();
        Self {
            config,
            programs,
            program,
            state: RegulatorState::Idle,
            current_temp_c: None,
            last_reading_ms: None,
            cooler_on: false,
            heater_on: false,
            last_cooler_change_ms: None,
            last_heater_change_ms: None,
        }
    }

    pub fn program(&self) -> Program {
        self.program
    }

    pub fn programs(&self) -> &ProgramTable {
        &self.programs
    }

    pub fn thresholds(&self) -> Thresholds {
        self.programs.thresholds(self.program)
    }

    pub fn state(&self) -> RegulatorState {
        self.state
    }

    pub fn current_temp_c(&self) -> Option<f32> {
        self.current_temp_c
    }

    pub fn is_cooler_on(&self) -> bool {
        self.cooler_on
    }

    pub fn is_heater_on(&self) -> bool {
        self.heater_on
    }

    pub fn set_program(&mut self, program: Program) -> bool {
        if self.program != program {
            self.program = program;
            true
        } else {
            false
        }
    }

    pub fn set_programs(&mut self, mut programs: ProgramTable) -> bool {
        programs.sanitize();
        if self.programs != programs {
            self.programs = programs;
            true
        } else {
            false
        }
    }

    pub fn update_temperature(&mut self, temp_c: f32, now_ms: u64) {
        self.current_temp_c = Some(temp_c);
        self.last_reading_ms = Some(now_ms);
    }

    pub fn is_sensor_data_valid(&self, now_ms: u64) -> bool {
        self.last_reading_ms
            .map(|last| now_ms.saturating_sub(last) < self.config.sensor_stale_timeout_ms)
            .unwrap_or(false)
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<RelayAction> {
        let mut actions = Vec::new();
        self.evaluate_state(now_ms, &mut actions);
        actions
    }

    /// Drops both relays regardless of the cycle lock.
    pub fn shutdown(&mut self, now_ms: u64) -> Vec<RelayAction> {
        let mut actions = Vec::new();
        self.switch_off(Relay::Cooler, now_ms, &mut actions);
        self.switch_off(Relay::Heater, now_ms, &mut actions);
        self.state = RegulatorState::Idle;
        actions
    }

    pub fn cycle_lock_remaining_ms(&self, relay: Relay, now_ms: u64) -> u64 {
        match self.last_change_ms(relay) {
            Some(last) => self
                .config
                .min_cycle_ms
                .saturating_sub(now_ms.saturating_sub(last)),
            None => 0,
        }
    }

    pub fn status(&self, now_ms: u64) -> RegulatorStatus {
        let thresholds = self.thresholds();
        RegulatorStatus {
            program: self.program,
            program_flag: self.program.flag() as char,
            min_temp: thresholds.min_c,
            max_temp: thresholds.max_c,
            current_temp: self.current_temp_c,
            state: self.state.as_str(),
            cooler_on: self.cooler_on,
            heater_on: self.heater_on,
            sensor_valid: self.is_sensor_data_valid(now_ms),
            reading_age_ms: self.last_reading_ms.map(|last| now_ms.saturating_sub(last)),
            cycle_lock_remaining_ms: self
                .cycle_lock_remaining_ms(Relay::Cooler, now_ms)
                .max(self.cycle_lock_remaining_ms(Relay::Heater, now_ms)),
        }
    }

    pub fn state_payload(&self) -> RegulatorStatePayload {
        let thresholds = self.thresholds();
        RegulatorStatePayload {
            program: self.program.flag() as char,
            temp: self.current_temp_c,
            min: thresholds.min_c,
            max: thresholds.max_c,
            state: self.state.as_str(),
            cooler: self.cooler_on,
            heater: self.heater_on,
        }
    }

    fn evaluate_state(&mut self, now_ms: u64, actions: &mut Vec<RelayAction>) {
        let temp = match self.current_temp_c {
            Some(temp) if self.is_sensor_data_valid(now_ms) => temp,
            _ => {
                self.switch_off(Relay::Cooler, now_ms, actions);
                self.switch_off(Relay::Heater, now_ms, actions);
                self.state = RegulatorState::Idle;
                return;
            }
        };

        let thresholds = self.thresholds();

        if temp > thresholds.max_c {
            self.switch_off(Relay::Heater, now_ms, actions);
            if self.can_change_state(Relay::Cooler, now_ms) {
                self.switch_on(Relay::Cooler, now_ms, actions);
            }
            self.state = RegulatorState::Cooling;
            return;
        }

        if temp < thresholds.min_c {
            self.switch_off(Relay::Cooler, now_ms, actions);
            if self.can_change_state(Relay::Heater, now_ms) {
                self.switch_on(Relay::Heater, now_ms, actions);
            }
            self.state = RegulatorState::Heating;
            return;
        }

        // Inside the band: run an active relay down to the midpoint.
        let midpoint = thresholds.midpoint();
        if self.cooler_on && temp <= midpoint && self.can_change_state(Relay::Cooler, now_ms) {
            self.switch_off(Relay::Cooler, now_ms, actions);
        }
        if self.heater_on && temp >= midpoint && self.can_change_state(Relay::Heater, now_ms) {
            self.switch_off(Relay::Heater, now_ms, actions);
        }

        self.state = if self.cooler_on {
            RegulatorState::Cooling
        } else if self.heater_on {
            RegulatorState::Heating
        } else {
            RegulatorState::Satisfied
        };
    }

    fn can_change_state(&self, relay: Relay, now_ms: u64) -> bool {
        self.last_change_ms(relay)
            .map(|last| now_ms.saturating_sub(last) >= self.config.min_cycle_ms)
            .unwrap_or(true)
    }

    fn last_change_ms(&self, relay: Relay) -> Option<u64> {
        match relay {
            Relay::Cooler => self.last_cooler_change_ms,
            Relay::Heater => self.last_heater_change_ms,
        }
    }

    fn switch_on(&mut self, relay: Relay, now_ms: u64, actions: &mut Vec<RelayAction>) {
        // Never energize both relays.
        match relay {
            Relay::Cooler => {
                self.switch_off(Relay::Heater, now_ms, actions);
                if self.cooler_on {
                    return;
                }
                self.cooler_on = true;
                self.last_cooler_change_ms = Some(now_ms);
                actions.push(RelayAction::CoolerOn);
            }
            Relay::Heater => {
                self.switch_off(Relay::Cooler, now_ms, actions);
                if self.heater_on {
                    return;
                }
                self.heater_on = true;
                self.last_heater_change_ms = Some(now_ms);
                actions.push(RelayAction::HeaterOn);
            }
        }
    }

    fn switch_off(&mut self, relay: Relay, now_ms: u64, actions: &mut Vec<RelayAction>) {
        match relay {
            Relay::Cooler if self.cooler_on => {
                self.cooler_on = false;
                self.last_cooler_change_ms = Some(now_ms);
                actions.push(RelayAction::CoolerOff);
            }
            Relay::Heater if self.heater_on => {
                self.heater_on = false;
                self.last_heater_change_ms = Some(now_ms);
                actions.push(RelayAction::HeaterOff);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regulator(program: Program) -> Regulator {
        Regulator::new(RegulatorConfig::default(), ProgramTable::default(), program)
    }

    #[test]
    fn heats_when_below_minimum() {
        let mut regulator = regulator(Program::Fermentation);

        regulator.update_temperature(17.5, 1_000);
        let actions = regulator.tick(1_500);

        assert_eq!(actions, vec![RelayAction::HeaterOn]);
        assert!(regulator.is_heater_on());
        assert!(!regulator.is_cooler_on());
        assert_eq!(regulator.state(), RegulatorState::Heating);
    }

    #[test]
    fn cools_when_above_maximum() {
        let mut regulator = regulator(Program::Maturation);

        regulator.update_temperature(4.0, 1_000);
        let actions = regulator.tick(1_000);

        assert_eq!(actions, vec![RelayAction::CoolerOn]);
        assert_eq!(regulator.state(), RegulatorState::Cooling);
    }

    #[test]
    fn relays_are_interlocked() {
        let mut regulator = regulator(Program::Fermentation);
        regulator.update_temperature(15.0, 0);
        assert_eq!(regulator.tick(0), vec![RelayAction::HeaterOn]);

        regulator.update_temperature(25.0, 1_000);
        let actions = regulator.tick(1_000);

        assert_eq!(actions, vec![RelayAction::HeaterOff, RelayAction::CoolerOn]);
        assert!(regulator.is_cooler_on());
        assert!(!regulator.is_heater_on());
    }

    #[test]
    fn cooling_runs_down_to_band_midpoint() {
        let mut regulator = regulator(Program::Fermentation);
        regulator.update_temperature(23.0, 0);
        assert_eq!(regulator.tick(0), vec![RelayAction::CoolerOn]);

        let min_cycle = regulator.config.min_cycle_ms;

        // Back inside the band but above the midpoint (20.5).
        regulator.update_temperature(21.0, min_cycle);
        assert!(regulator.tick(min_cycle).is_empty());
        assert_eq!(regulator.state(), RegulatorState::Cooling);

        regulator.update_temperature(20.4, min_cycle + 1_000);
        assert_eq!(
            regulator.tick(min_cycle + 1_000),
            vec![RelayAction::CoolerOff]
        );
        assert_eq!(regulator.state(), RegulatorState::Satisfied);
    }

    #[test]
    fn min_cycle_blocks_compressor_restart() {
        let mut regulator = regulator(Program::Fermentation);
        regulator.update_temperature(23.0, 0);
        let _ = regulator.tick(0);

        let min_cycle = regulator.config.min_cycle_ms;
        regulator.update_temperature(20.0, min_cycle);
        assert_eq!(regulator.tick(min_cycle), vec![RelayAction::CoolerOff]);

        regulator.update_temperature(23.0, min_cycle + 10_000);
        assert!(regulator.tick(min_cycle + 10_000).is_empty());
        assert_eq!(regulator.state(), RegulatorState::Cooling);
        assert_eq!(
            regulator.cycle_lock_remaining_ms(Relay::Cooler, min_cycle + 10_000),
            min_cycle - 10_000
        );

        regulator.update_temperature(23.0, 2 * min_cycle);
        assert_eq!(regulator.tick(2 * min_cycle), vec![RelayAction::CoolerOn]);
    }

    #[test]
    fn stale_reading_drops_relays_immediately() {
        let mut regulator = regulator(Program::Fermentation);
        regulator.update_temperature(23.0, 100);
        assert_eq!(regulator.tick(100), vec![RelayAction::CoolerOn]);

        let stale_at = 100 + regulator.config.sensor_stale_timeout_ms;
        let actions = regulator.tick(stale_at);

        assert_eq!(actions, vec![RelayAction::CoolerOff]);
        assert_eq!(regulator.state(), RegulatorState::Idle);
    }

    #[test]
    fn no_reading_keeps_relays_off() {
        let mut regulator = regulator(Program::Priming);

        assert!(regulator.tick(5_000).is_empty());
        assert_eq!(regulator.state(), RegulatorState::Idle);
        assert!(!regulator.status(5_000).sensor_valid);
    }

    #[test]
    fn program_change_moves_thresholds() {
        let mut regulator = regulator(Program::Fermentation);
        regulator.update_temperature(20.0, 0);
        assert!(regulator.tick(0).is_empty());
        assert_eq!(regulator.state(), RegulatorState::Satisfied);

        assert!(regulator.set_program(Program::Maturation));
        assert!(!regulator.set_program(Program::Maturation));
        assert_eq!(regulator.thresholds(), Thresholds::new(1.0, 2.0));

        assert_eq!(regulator.tick(1_000), vec![RelayAction::CoolerOn]);
    }

    #[test]
    fn shutdown_ignores_cycle_lock() {
        let mut regulator = regulator(Program::Fermentation);
        regulator.update_temperature(10.0, 0);
        let _ = regulator.tick(0);

        assert_eq!(regulator.shutdown(1), vec![RelayAction::HeaterOff]);
        assert_eq!(regulator.state(), RegulatorState::Idle);
    }

    #[test]
    fn status_reports_active_program() {
        let mut regulator = regulator(Program::Priming);
        regulator.update_temperature(21.0, 1_000);
        let _ = regulator.tick(1_000);

        let status = regulator.status(3_000);

        assert_eq!(status.program_flag, 'P');
        assert_eq!(status.min_temp, 20.0);
        assert_eq!(status.max_temp, 22.0);
        assert_eq!(status.reading_age_ms, Some(2_000));
        assert_eq!(status.state, "SATISFIED");
        assert!(status.sensor_valid);
    }
}
