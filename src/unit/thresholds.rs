use crate::prelude::*;

use crate::unit::crc8::threshold_crc;

// Conversion factors from amps to the ADC codes the power unit compares
// against. Both must end up in a single byte.
const CONSUMPTION_SCALE: f64 = 24.0 * 33.0 / 50.0;
const LEAK_SCALE: f64 = 65534.0 * 33.0 / 1500.0;

pub fn consumption_code(amps: f64) -> Result<u8> {
    to_byte((amps * CONSUMPTION_SCALE).ceil(), "consumption", amps)
}

pub fn leak_code(amps: f64) -> Result<u8> {
    to_byte((amps * LEAK_SCALE).round(), "leak", amps)
}

fn to_byte(code: f64, what: &str, amps: f64) -> Result<u8> {
    if !code.is_finite() || !(0.0..=255.0).contains(&code) {
        bail!("{} threshold {}A does not fit in one byte (code {})", what, amps, code);
    }

    Ok(code as u8)
}

/// Encoded thresholds for both channels of one power unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub consumption: [u8; 2],
    pub leak: [u8; 2],
}

impl Thresholds {
    pub fn new(max_consumption_current: [f64; 2], max_leak_current: [f64; 2]) -> Result<Self> {
        Ok(Self {
            consumption: [
                consumption_code(max_consumption_current[0])?,
                consumption_code(max_consumption_current[1])?,
            ],
            leak: [
                leak_code(max_leak_current[0])?,
                leak_code(max_leak_current[1])?,
            ],
        })
    }

    pub fn consumption_command(&self, unit: &UnitAddress) -> String {
        Self::command("hgrp", self.consumption, unit)
    }

    pub fn leak_command(&self, unit: &UnitAddress) -> String {
        Self::command("hlgrp", self.leak, unit)
    }

    fn command(group: &str, values: [u8; 2], unit: &UnitAddress) -> String {
        format!(
            "adc {} {} {} {} {} {}",
            group,
            values[0],
            values[1],
            threshold_crc(values[0]),
            threshold_crc(values[1]),
            unit
        )
    }
}
