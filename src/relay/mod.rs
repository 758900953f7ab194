pub mod gpio;

use std::fmt;

use anyhow::{Context, Result};
use embedded_hal::digital::{PinState, StatefulOutputPin};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, RelayDriver};

use self::gpio::{GpioError, SimulatedPin, SysfsPin};

/// Logical state of the motor relays, as written to the `state` column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    #[default]
    Off,
    On,
}

impl RelayState {
    pub fn is_on(self) -> bool {
        self == RelayState::On
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelayState::Off => "off",
            RelayState::On => "on",
        })
    }
}

pub type RelayPin = Box<dyn StatefulOutputPin<Error = GpioError> + Send + Sync>;

/// All motor channels of one machine, switched together.
pub struct RelayBank {
    pins: Vec<RelayPin>,
    active_high: bool,
}

impl RelayBank {
    pub fn new(pins: Vec<RelayPin>, active_high: bool) -> Self {
        Self { pins, active_high }
    }

    pub fn channels(&self) -> usize {
        self.pins.len()
    }

    /// Electrical level that puts a channel into `state`.
    fn level(&self, state: RelayState) -> PinState {
        PinState::from(state.is_on() == self.active_high)
    }

    /// Drive every channel to `state`.
    ///
    /// All channels are attempted even if one fails; the first error is
    /// returned.
    pub fn drive(&mut self, state: RelayState) -> Result<(), GpioError> {
        let level = self.level(state);
        let mut first_err = None;
        for pin in &mut self.pins {
            if let Err(e) = pin.set_state(level) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Re-drive any channel whose output no longer matches `state`.
    /// Returns how many channels had to be corrected.
    pub fn enforce(&mut self, state: RelayState) -> Result<usize, GpioError> {
        let want_high = self.level(state) == PinState::High;
        let mut corrected = 0;
        for pin in &mut self.pins {
            if pin.is_set_high()? != want_high {
                pin.set_state(PinState::from(want_high))?;
                corrected += 1;
            }
        }
        Ok(corrected)
    }
}

/// Open one output per configured relay line, parked at the inactive level.
pub fn open_bank(config: &Config) -> Result<RelayBank> {
    // Inactive level: low for active-high boards, high for active-low ones.
    let initial_high = !config.relay_active_high;

    let pins = config
        .relay_pins
        .iter()
        .map(|&line| -> Result<RelayPin> {
            match config.relay_driver {
                RelayDriver::Sysfs => {
                    let line = line + config.gpio_sysfs_base;
                    let pin = SysfsPin::open(&config.gpio_sysfs_root, line, initial_high)
                        .with_context(|| format!("failed to open relay on gpio{line}"))?;
                    Ok(Box::new(pin))
                }
                RelayDriver::Simulated => Ok(Box::new(SimulatedPin::new(initial_high))),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    if config.relay_driver == RelayDriver::Simulated {
        warn!("Using simulated relay driver; no hardware will be switched");
    }
    info!(
        lines = ?config.relay_pins,
        active_high = config.relay_active_high,
        driver = ?config.relay_driver,
        "Relay outputs initialised"
    );

    Ok(RelayBank::new(pins, config.relay_active_high))
}
