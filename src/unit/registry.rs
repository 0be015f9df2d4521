use crate::prelude::*;

use crate::unit::port::{connector_for, Connector, SerialPortChannel};
use crate::unit::snapshot::{InputUnitSnapshot, PowerUnitSnapshot};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// Nesting-safe flag: set while at least one guard is alive.
#[derive(Debug, Default)]
struct Depth(AtomicUsize);

impl Depth {
    fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

pub struct DepthGuard<'a>(&'a Depth);

impl<'a> DepthGuard<'a> {
    fn new(depth: &'a Depth) -> Self {
        depth.0.fetch_add(1, Ordering::SeqCst);
        Self(depth)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::SeqCst);
    }
}

// PowerUnit {{{
pub struct PowerUnit {
    pub address: UnitAddress,
    pub config: config::PowerUnit,
    pub port: SerialPortChannel,
    pub snapshot: PowerUnitSnapshot,
    maintenance: Depth,
    initializing: Depth,
}

impl PowerUnit {
    pub fn new(config: config::PowerUnit, connector: Box<dyn Connector>, timeouts: &config::Timeouts) -> Self {
        Self {
            address: config.address.clone(),
            port: SerialPortChannel::new(config.address.as_str(), connector, timeouts.port()),
            config,
            snapshot: PowerUnitSnapshot::new(),
            maintenance: Depth::default(),
            initializing: Depth::default(),
        }
    }

    pub fn channel(&self, position: ChannelPosition) -> ChannelAddress {
        ChannelAddress::new(self.address.clone(), position)
    }

    pub fn channel_state(&self, position: ChannelPosition) -> Option<ChannelState> {
        self.snapshot.channel_state(position)
    }

    /// True once both channels have reported a state outside `states`.
    pub fn channels_left(&self, states: &[ChannelState]) -> bool {
        self.snapshot
            .channel_states()
            .iter()
            .all(|s| matches!(s, Some(s) if !states.contains(s)))
    }

    pub fn any_channel_in(&self, state: ChannelState) -> bool {
        self.snapshot.channel_states().contains(&Some(state))
    }

    /// `ch1 off, ch2 not reported` style summary for log and error messages.
    pub fn describe_channels(&self) -> String {
        let states = self.snapshot.channel_states();
        ChannelPosition::BOTH
            .iter()
            .map(|p| match states[p.index()] {
                Some(state) => format!("ch{} {}", p, state),
                None => format!("ch{} not reported", p),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// While in maintenance the unit is expected to reset itself; counter
    /// restarts and idle channels are not treated as reboots.
    pub fn in_maintenance(&self) -> bool {
        self.maintenance.is_set()
    }

    pub fn enter_maintenance(&self) -> DepthGuard<'_> {
        DepthGuard::new(&self.maintenance)
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.is_set()
    }

    pub(crate) fn begin_initialization(&self) -> DepthGuard<'_> {
        DepthGuard::new(&self.initializing)
    }

    pub async fn send(&self, command: &str) -> bool {
        self.port.write(command.as_bytes()).await
    }
} // }}}

// InputUnit {{{
pub struct InputUnit {
    pub address: UnitAddress,
    pub config: config::InputUnit,
    pub port: SerialPortChannel,
    pub snapshot: InputUnitSnapshot,
}

impl InputUnit {
    pub fn new(config: config::InputUnit, connector: Box<dyn Connector>, timeouts: &config::Timeouts) -> Self {
        Self {
            address: config.address.clone(),
            port: SerialPortChannel::new(config.address.as_str(), connector, timeouts.port()),
            config,
            snapshot: InputUnitSnapshot::new(),
        }
    }
} // }}}

/// Every configured unit, keyed by address. Fixed after startup.
#[derive(Default)]
pub struct UnitRegistry {
    power: BTreeMap<UnitAddress, Arc<PowerUnit>>,
    input: BTreeMap<UnitAddress, Arc<InputUnit>>,
}

impl UnitRegistry {
    pub fn new(config: &ConfigWrapper) -> Self {
        Self::with_connectors(config, |port, baud_rate| connector_for(port, baud_rate))
    }

    /// Builds the registry with a custom way of reaching each port.
    pub fn with_connectors<F>(config: &ConfigWrapper, mut connect: F) -> Self
    where
        F: FnMut(&str, u32) -> Box<dyn Connector>,
    {
        let timeouts = config.timeouts();

        let power = config
            .power_units()
            .into_iter()
            .map(|unit| {
                let connector = connect(unit.port(), unit.baud_rate());
                (unit.address.clone(), Arc::new(PowerUnit::new(unit, connector, &timeouts)))
            })
            .collect();

        let input = config
            .input_units()
            .into_iter()
            .map(|unit| {
                let connector = connect(unit.port(), unit.baud_rate());
                (unit.address.clone(), Arc::new(InputUnit::new(unit, connector, &timeouts)))
            })
            .collect();

        Self { power, input }
    }

    pub fn power_unit(&self, address: &UnitAddress) -> Option<Arc<PowerUnit>> {
        self.power.get(address).cloned()
    }

    pub fn input_unit(&self, address: &UnitAddress) -> Option<Arc<InputUnit>> {
        self.input.get(address).cloned()
    }

    pub fn power_units(&self) -> impl Iterator<Item = &Arc<PowerUnit>> {
        self.power.values()
    }

    pub fn input_units(&self) -> impl Iterator<Item = &Arc<InputUnit>> {
        self.input.values()
    }

    pub fn channel_addresses(&self) -> Vec<ChannelAddress> {
        self.power
            .keys()
            .flat_map(ChannelAddress::both)
            .collect()
    }

    pub async fn open_all(&self) {
        for unit in self.power.values() {
            unit.port.open().await;
        }
        for unit in self.input.values() {
            unit.port.open().await;
        }
    }

    pub async fn close_all(&self) {
        for unit in self.power.values() {
            unit.port.close().await;
        }
        for unit in self.input.values() {
            unit.port.close().await;
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.ports().map(|p| p.frames_written()).sum()
    }

    pub fn write_failures(&self) -> u64 {
        self.ports().map(|p| p.write_failures()).sum()
    }

    fn ports(&self) -> impl Iterator<Item = &SerialPortChannel> {
        self.power
            .values()
            .map(|u| &u.port)
            .chain(self.input.values().map(|u| &u.port))
    }
}
