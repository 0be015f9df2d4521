use crate::prelude::*;

use crate::unit::snapshot::{InputUnitState, PowerUnitState};
use crate::unit::UnitRegistry;

use serde::Serialize;
use serde_json::json;
use std::f64::consts::PI;

/// Load angle units per half turn, as reported in `ld` parcels.
const ANGLE_STEPS: f64 = 80.0;

pub fn phase_angle(angle: u16) -> f64 {
    f64::from(angle) * PI / ANGLE_STEPS
}

pub fn timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ChannelValues<T> {
    #[serde(rename = "channelValue1")]
    value1: T,
    #[serde(rename = "channelValue2")]
    value2: T,
    addr: String,
    timestamp: f64,
}

// PowerUnitMetrics {{{
#[derive(Debug, Clone, PartialEq)]
pub struct PowerUnitMetrics {
    pub addr: UnitAddress,
    pub voltage: f64,
    pub frequency: f64,
    pub current: [f64; 2],
    pub active_power: [f64; 2],
    pub reactive_power: [f64; 2],
    pub temperature: [u16; 2],
}

impl PowerUnitMetrics {
    /// `None` until current, load and temperature have all been sampled.
    pub fn from_state(addr: &UnitAddress, state: &PowerUnitState, voltage: f64, frequency: f64) -> Option<Self> {
        let current = state.current?;
        let load = state.load?;
        let temperature = state.temperature?;

        let mut active_power = [0.0; 2];
        let mut reactive_power = [0.0; 2];
        for i in 0..2 {
            let phi = phase_angle(load.angle[i]);
            active_power[i] = voltage * current[i] * phi.cos();
            reactive_power[i] = voltage * current[i] * phi.sin();
        }

        Some(Self {
            addr: addr.clone(),
            voltage,
            frequency,
            current,
            active_power,
            reactive_power,
            temperature,
        })
    }

    pub fn messages(&self, timestamp: f64) -> Result<Vec<mqtt::Message>> {
        let values = |topic: &str, v: [f64; 2]| {
            mqtt::Message::json(
                topic,
                &ChannelValues {
                    value1: v[0],
                    value2: v[1],
                    addr: self.addr.to_string(),
                    timestamp,
                },
            )
        };
        let temperature = [f64::from(self.temperature[0]), f64::from(self.temperature[1])];

        Ok(vec![
            values("info/current", self.current)?,
            values("info/active_power", self.active_power)?,
            values("info/reactive_power", self.reactive_power)?,
            values("info/frequency", [self.frequency, self.frequency])?,
            values("info/temperature", temperature)?,
            mqtt::Message::json(
                "info/metrics",
                &json!({
                    "Pa1": self.active_power[0],
                    "Pa2": self.active_power[1],
                    "Pr1": self.reactive_power[0],
                    "Pr2": self.reactive_power[1],
                    "I1": self.current[0],
                    "I2": self.current[1],
                    "T1": self.temperature[0],
                    "T2": self.temperature[1],
                    "U": self.voltage,
                    "F": self.frequency,
                    "addr": self.addr,
                }),
            )?,
        ])
    }
} // }}}

// InputUnitMetrics {{{
#[derive(Debug, Clone, PartialEq)]
pub struct InputUnitMetrics {
    pub addr: UnitAddress,
    pub voltage: f64,
    pub frequency: f64,
    pub own_power: f64,
}

impl InputUnitMetrics {
    /// Power drawn by the board itself: `Vin * (Iin + Iout + Iypr)`.
    pub fn from_state(addr: &UnitAddress, state: &InputUnitState) -> Option<Self> {
        let voltage = state.voltage?;
        let current = state.current?;

        Some(Self {
            addr: addr.clone(),
            voltage: voltage.vin,
            frequency: voltage.frequency,
            own_power: voltage.vin * (current.iin + current.iout + current.iypr),
        })
    }

    pub fn message(&self, timestamp: f64) -> Result<mqtt::Message> {
        mqtt::Message::json(
            "info/input_metrics",
            &json!({
                "U": self.voltage,
                "F": self.frequency,
                "P_own": self.own_power,
                "addr": self.addr,
                "timestamp": timestamp,
            }),
        )
    }
} // }}}

/// Everything one telemetry tick publishes, for units with complete samples.
pub fn collect(units: &UnitRegistry, nominal_voltage: f64, timestamp: f64) -> Result<Vec<mqtt::Message>> {
    let mut messages = Vec::new();

    for unit in units.power_units() {
        let frequency = unit
            .config
            .input_unit()
            .and_then(|addr| units.input_unit(addr))
            .and_then(|input| input.snapshot.voltage())
            .map(|v| v.frequency)
            .unwrap_or(0.0);

        match PowerUnitMetrics::from_state(&unit.address, &unit.snapshot.state(), nominal_voltage, frequency) {
            Some(metrics) => messages.extend(metrics.messages(timestamp)?),
            None => trace!("{}: samples incomplete, no metrics", unit.address),
        }
    }

    for unit in units.input_units() {
        if let Some(metrics) = InputUnitMetrics::from_state(&unit.address, &unit.snapshot.state()) {
            messages.push(metrics.message(timestamp)?);
        }
    }

    Ok(messages)
}
