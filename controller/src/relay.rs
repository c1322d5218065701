#[cfg(feature = "esp32")]
use anyhow::Context;
#[cfg(test)]
use anyhow::anyhow;
#[cfg(feature = "esp32")]
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
#[cfg(feature = "esp32")]
use log::{info, warn};
#[cfg(not(feature = "esp32"))]
use tracing::{info, warn};
use serde::Serialize;

use fermenter_common::{Relay, RelayAction, RelayConfig};

enum RelayBackend {
    #[cfg(feature = "esp32")]
    Gpio {
        cooler: PinDriver<'static, AnyOutputPin, Output>,
        heater: PinDriver<'static, AnyOutputPin, Output>,
    },
    Simulated,
    #[cfg(test)]
    Faulty(Relay),
}

pub struct RelayBank {
    backend: RelayBackend,
    config: RelayConfig,
    cooler_on: bool,
    heater_on: bool,
    switch_count: u64,
    failed_actions: u64,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayDiagnostics {
    pub hardware: bool,
    #[serde(rename = "coolerPin")]
    pub cooler_pin: i32,
    #[serde(rename = "heaterPin")]
    pub heater_pin: i32,
    #[serde(rename = "activeLow")]
    pub active_low: bool,
    #[serde(rename = "coolerOn")]
    pub cooler_on: bool,
    #[serde(rename = "heaterOn")]
    pub heater_on: bool,
    #[serde(rename = "switchCount")]
    pub switch_count: u64,
    #[serde(rename = "failedActions")]
    pub failed_actions: u64,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

impl RelayBank {
    #[cfg(feature = "esp32")]
    pub fn gpio(config: &RelayConfig) -> anyhow::Result<Self> {
        let cooler = unsafe { PinDriver::output(AnyOutputPin::new(config.cooler_pin)) }
            .with_context(|| format!("cooler relay unavailable on GPIO{}", config.cooler_pin))?;
        let heater = unsafe { PinDriver::output(AnyOutputPin::new(config.heater_pin)) }
            .with_context(|| format!("heater relay unavailable on GPIO{}", config.heater_pin))?;

        let mut bank = Self::with_backend(RelayBackend::Gpio { cooler, heater }, config);
        bank.drive(Relay::Cooler, false)?;
        bank.drive(Relay::Heater, false)?;
        info!(
            "relays initialized: cooler GPIO{} / heater GPIO{} (active_low={})",
            config.cooler_pin, config.heater_pin, config.active_low
        );
        Ok(bank)
    }

    pub fn simulated(config: &RelayConfig) -> Self {
        Self::with_backend(RelayBackend::Simulated, config)
    }

    /// Simulated bank whose `relay` refuses to switch.
    #[cfg(test)]
    pub fn faulty(config: &RelayConfig, relay: Relay) -> Self {
        Self::with_backend(RelayBackend::Faulty(relay), config)
    }

    fn with_backend(backend: RelayBackend, config: &RelayConfig) -> Self {
        Self {
            backend,
            config: config.clone(),
            cooler_on: false,
            heater_on: false,
            switch_count: 0,
            failed_actions: 0,
            last_error: None,
        }
    }

    pub fn is_on(&self, relay: Relay) -> bool {
        match relay {
            Relay::Cooler => self.cooler_on,
            Relay::Heater => self.heater_on,
        }
    }

    pub fn apply(&mut self, action: RelayAction) -> anyhow::Result<()> {
        let relay = action.relay();
        let on = action.energize();

        if let Err(err) = self.drive(relay, on) {
            self.failed_actions = self.failed_actions.saturating_add(1);
            self.last_error = Some(format!("{err:#}"));
            return Err(err);
        }

        self.switch_count = self.switch_count.saturating_add(1);
        info!(
            "relay {:?} {} (GPIO{} level {})",
            relay,
            if on { "on" } else { "off" },
            self.pin(relay),
            u8::from(self.pin_level(on))
        );
        Ok(())
    }

    /// Applies a batch in order. The first failure aborts the batch and
    /// releases both relays so a half-applied interlock never leaves both on.
    pub fn apply_all(&mut self, actions: Vec<RelayAction>) -> anyhow::Result<()> {
        for action in actions {
            if let Err(err) = self.apply(action) {
                if let Err(release_err) = self.all_off() {
                    warn!("relay release after failure also failed: {release_err:#}");
                }
                return Err(err.context(format!("relay action {action:?} failed")));
            }
        }
        Ok(())
    }

    /// Drives both relays off, attempting each even if the other fails.
    pub fn all_off(&mut self) -> anyhow::Result<()> {
        let cooler = self.drive(Relay::Cooler, false);
        let heater = self.drive(Relay::Heater, false);
        cooler.and(heater)
    }

    pub fn diagnostics(&self) -> RelayDiagnostics {
        RelayDiagnostics {
            hardware: !matches!(self.backend, RelayBackend::Simulated),
            cooler_pin: self.config.cooler_pin,
            heater_pin: self.config.heater_pin,
            active_low: self.config.active_low,
            cooler_on: self.cooler_on,
            heater_on: self.heater_on,
            switch_count: self.switch_count,
            failed_actions: self.failed_actions,
            last_error: self.last_error.clone(),
        }
    }

    fn pin(&self, relay: Relay) -> i32 {
        match relay {
            Relay::Cooler => self.config.cooler_pin,
            Relay::Heater => self.config.heater_pin,
        }
    }

    fn pin_level(&self, on: bool) -> bool {
        on != self.config.active_low
    }

    fn drive(&mut self, relay: Relay, on: bool) -> anyhow::Result<()> {
        #[cfg(feature = "esp32")]
        let high = self.pin_level(on);
        match &mut self.backend {
            #[cfg(feature = "esp32")]
            RelayBackend::Gpio { cooler, heater } => {
                let pin = match relay {
                    Relay::Cooler => cooler,
                    Relay::Heater => heater,
                };
                if high {
                    pin.set_high()?;
                } else {
                    pin.set_low()?;
                }
            }
            RelayBackend::Simulated => {}
            #[cfg(test)]
            RelayBackend::Faulty(faulty) if *faulty == relay => {
                return Err(anyhow!("{relay:?} relay stuck"));
            }
            #[cfg(test)]
            RelayBackend::Faulty(_) => {}
        }

        match relay {
            Relay::Cooler => self.cooler_on = on,
            Relay::Heater => self.heater_on = on,
        }
        Ok(())
    }
}
