use crate::prelude::*;

use crate::unit::parcel::ParcelKind;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Stored in place of a packet counter once the unit has been (re)initialized.
pub const COUNTER_SENTINEL: u32 = u32::MAX;

// Counters {{{
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterVerdict {
    /// nothing stored yet for this kind
    FirstContact,
    /// counter restarted from zero outside maintenance
    Reboot { previous: u32 },
    Healthy,
}

/// Last packet counter per parcel kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters(HashMap<ParcelKind, u32>);

impl Counters {
    pub fn get(&self, kind: ParcelKind) -> Option<u32> {
        self.0.get(&kind).copied()
    }

    pub(crate) fn set(&mut self, kind: ParcelKind, counter: u32) {
        self.0.insert(kind, counter);
    }

    pub(crate) fn reset(&mut self, kinds: &[ParcelKind]) {
        for kind in kinds {
            self.0.insert(*kind, COUNTER_SENTINEL);
        }
    }

    /// Classifies an incoming counter and, on first contact or reboot, parks
    /// every kind of the unit at the sentinel. The caller stores the new
    /// counter afterwards.
    pub(crate) fn check(
        &mut self,
        kinds: &[ParcelKind],
        kind: ParcelKind,
        counter: u32,
        maintenance: bool,
    ) -> CounterVerdict {
        match self.get(kind) {
            None => {
                self.reset(kinds);
                CounterVerdict::FirstContact
            }
            Some(previous) if counter == 0 && previous != COUNTER_SENTINEL && !maintenance => {
                self.reset(kinds);
                CounterVerdict::Reboot { previous }
            }
            Some(_) => CounterVerdict::Healthy,
        }
    }
} // }}}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

// Power unit {{{
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelStatus {
    pub state: Option<ChannelState>,
    pub signal: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadSample {
    pub load: [u16; 2],
    pub angle: [u16; 2],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerUnitState {
    pub link: bool,
    pub channels: [ChannelStatus; 2],
    pub current: Option<[f64; 2]>,
    pub load: Option<LoadSample>,
    pub temperature: Option<[u16; 2]>,
    pub insulation: [Option<String>; 2],
    pub counters: Counters,
}

/// A channel whose reported state differs from the previous parcel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub position: ChannelPosition,
    pub previous: Option<ChannelState>,
    pub current: ChannelState,
}

/// Live view of a power unit. Cheap to clone; all clones share the record.
#[derive(Debug, Clone, Default)]
pub struct PowerUnitSnapshot {
    inner: Arc<RwLock<PowerUnitState>>,
}

impl PowerUnitSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PowerUnitState {
        read(&self.inner).clone()
    }

    pub fn link(&self) -> bool {
        read(&self.inner).link
    }

    pub fn channel_state(&self, position: ChannelPosition) -> Option<ChannelState> {
        read(&self.inner).channels[position.index()].state
    }

    pub fn channel_states(&self) -> [Option<ChannelState>; 2] {
        let inner = read(&self.inner);
        [inner.channels[0].state, inner.channels[1].state]
    }

    pub fn insulation(&self, position: ChannelPosition) -> Option<String> {
        read(&self.inner).insulation[position.index()].clone()
    }

    pub fn counter(&self, kind: ParcelKind) -> Option<u32> {
        read(&self.inner).counters.get(kind)
    }

    pub(crate) fn check_counter(&self, kind: ParcelKind, counter: u32, maintenance: bool) -> CounterVerdict {
        write(&self.inner)
            .counters
            .check(&ParcelKind::POWER, kind, counter, maintenance)
    }

    pub(crate) fn record_counter(&self, kind: ParcelKind, counter: u32) {
        write(&self.inner).counters.set(kind, counter);
    }

    pub(crate) fn apply_state(&self, states: [ChannelState; 2], signals: [u16; 2]) -> Vec<Transition> {
        let mut inner = write(&self.inner);
        inner.link = true;

        let mut transitions = Vec::new();
        for position in ChannelPosition::BOTH {
            let channel = &mut inner.channels[position.index()];
            let current = states[position.index()];

            if channel.state != Some(current) {
                transitions.push(Transition {
                    position,
                    previous: channel.state,
                    current,
                });
            }

            channel.state = Some(current);
            channel.signal = Some(signals[position.index()]);
        }

        transitions
    }

    pub(crate) fn set_current(&self, current: [f64; 2]) {
        write(&self.inner).current = Some(current);
    }

    pub(crate) fn set_load(&self, load: [u16; 2], angle: [u16; 2]) {
        write(&self.inner).load = Some(LoadSample { load, angle });
    }

    pub(crate) fn set_temperature(&self, temperature: [u16; 2]) {
        write(&self.inner).temperature = Some(temperature);
    }

    pub(crate) fn set_insulation(&self, position: ChannelPosition, value: String) {
        write(&self.inner).insulation[position.index()] = Some(value);
    }

    pub(crate) fn clear_insulation(&self, position: ChannelPosition) {
        write(&self.inner).insulation[position.index()] = None;
    }
} // }}}

// Input unit {{{
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoltageSample {
    pub vin: f64,
    pub frequency: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurrentSample {
    pub iin: f64,
    pub iout: f64,
    pub iypr: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputUnitState {
    pub link: bool,
    pub state: Option<u16>,
    pub signal: Option<u16>,
    pub voltage: Option<VoltageSample>,
    pub current: Option<CurrentSample>,
    pub counters: Counters,
}

#[derive(Debug, Clone, Default)]
pub struct InputUnitSnapshot {
    inner: Arc<RwLock<InputUnitState>>,
}

impl InputUnitSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> InputUnitState {
        read(&self.inner).clone()
    }

    pub fn link(&self) -> bool {
        read(&self.inner).link
    }

    pub fn voltage(&self) -> Option<VoltageSample> {
        read(&self.inner).voltage
    }

    pub fn counter(&self, kind: ParcelKind) -> Option<u32> {
        read(&self.inner).counters.get(kind)
    }

    pub(crate) fn check_counter(&self, kind: ParcelKind, counter: u32) -> CounterVerdict {
        write(&self.inner)
            .counters
            .check(&ParcelKind::INPUT, kind, counter, false)
    }

    pub(crate) fn record_counter(&self, kind: ParcelKind, counter: u32) {
        write(&self.inner).counters.set(kind, counter);
    }

    pub(crate) fn set_state(&self, state: u16, signal: u16) {
        let mut inner = write(&self.inner);
        inner.link = true;
        inner.state = Some(state);
        inner.signal = Some(signal);
    }

    pub(crate) fn set_voltage(&self, vin: f64, frequency: f64) {
        write(&self.inner).voltage = Some(VoltageSample { vin, frequency });
    }

    pub(crate) fn set_current(&self, iin: f64, iout: f64, iypr: f64) {
        write(&self.inner).current = Some(CurrentSample { iin, iout, iypr });
    }
} // }}}
