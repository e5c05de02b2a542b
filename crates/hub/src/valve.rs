//! Actuator control.  [`Actuator`] is the only way zone code opens or closes
//! a valve; [`ValveBoard`] drives a local relay board.  The `gpio` feature
//! gates the real rppal driver; without it, a mock implementation keeps the
//! relay states in memory and logs every change.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Logical on/off control of a named actuator.  Implementations must be
/// idempotent: switching an actuator to the state it is already in is fine.
pub trait Actuator: Send {
    fn set(&mut self, actuator: &str, on: bool) -> Result<()>;
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Real GPIO valve board (production: requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct ValveBoard {
    pins: HashMap<String, OutputPin>, // actuator -> GPIO pin
    active_low: bool,                 // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub fn new(actuator_to_gpio: &[(String, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (actuator, pin_num) in actuator_to_gpio {
            let mut pin = gpio.get(*pin_num)?.into_output();

            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(actuator.clone(), pin);
        }

        info!(valves = pins.len(), active_low, "gpio valve board initialised");
        Ok(Self { pins, active_low })
    }

    pub fn all_off(&mut self) {
        let keys: Vec<String> = self.pins.keys().cloned().collect();
        for k in keys {
            if let Err(e) = self.set(&k, false) {
                warn!(actuator = %k, "valve: all_off failed: {e:#}");
            }
        }
    }
}

#[cfg(feature = "gpio")]
impl Actuator for ValveBoard {
    fn set(&mut self, actuator: &str, on: bool) -> Result<()> {
        let pin = self
            .pins
            .get_mut(actuator)
            .ok_or_else(|| anyhow!("unknown actuator '{actuator}'"))?;

        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(actuator = %actuator, "valve set {}", on_off(on));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock valve board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct ValveBoard {
    pub(crate) relays: HashMap<String, bool>, // actuator -> on/off state
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub fn new(actuator_to_gpio: &[(String, u8)], _active_low: bool) -> Result<Self> {
        let mut relays = HashMap::new();
        for (actuator, pin_num) in actuator_to_gpio {
            info!(actuator = %actuator, gpio = pin_num, "mock-gpio: registered (not wired)");
            relays.insert(actuator.clone(), false);
        }
        info!(valves = relays.len(), "mock-gpio: valve board initialised (no hardware)");
        Ok(Self { relays })
    }

    pub fn all_off(&mut self) {
        for on in self.relays.values_mut() {
            *on = false;
        }
        info!("mock-gpio: all valves OFF");
    }
}

#[cfg(not(feature = "gpio"))]
impl Actuator for ValveBoard {
    fn set(&mut self, actuator: &str, on: bool) -> Result<()> {
        let state = self
            .relays
            .get_mut(actuator)
            .ok_or_else(|| anyhow!("unknown actuator '{actuator}'"))?;
        if *state == on {
            warn!(actuator = %actuator, "mock-gpio: valve already {}", on_off(on));
        }
        *state = on;
        info!(actuator = %actuator, "mock-gpio: valve set {}", on_off(on));
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
