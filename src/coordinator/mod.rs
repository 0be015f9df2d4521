use crate::prelude::*;

pub mod commands;
pub mod locks;

use crate::database::StateStore;
use crate::unit::port::RunFlag;
use crate::unit::reader::UnitReader;
use crate::unit::{PowerUnit, UnitRegistry};

use commands::initialize::InitializeUnit;
use commands::measure_insulation::MeasureInsulation;
use commands::set_channel_state::SetChannelState;
use futures::future::{BoxFuture, FutureExt};
use locks::ChannelLocks;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    /// sent by the reader loops on first contact, reboot or manual reset
    Initialize(UnitAddress),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

#[derive(Default, Debug)]
pub struct BridgeStats {
    pub parcels_received: u64,
    pub parcels_dropped: u64,
    pub reboots_detected: u64,
    pub initializations_started: u64,
    pub initializations_failed: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    pub bus_messages_sent: u64,
    pub bus_errors: u64,
    pub database_writes: u64,
    pub database_errors: u64,
}

impl BridgeStats {
    pub fn print_summary(&self, units: &UnitRegistry) {
        info!("Bridge Statistics:");
        info!("  Parcels:");
        info!("    Received: {}", self.parcels_received);
        info!("    Dropped: {}", self.parcels_dropped);
        info!("  Serial:");
        info!("    Frames written: {}", units.frames_written());
        info!("    Write failures: {}", units.write_failures());
        info!("  Units:");
        info!("    Reboots detected: {}", self.reboots_detected);
        info!("    Initializations: {}", self.initializations_started);
        info!("    Initializations failed: {}", self.initializations_failed);
        info!("  Commands:");
        info!("    Succeeded: {}", self.commands_succeeded);
        info!("    Failed: {}", self.commands_failed);
        info!("  MQTT:");
        info!("    Messages sent: {}", self.bus_messages_sent);
        info!("    Errors: {}", self.bus_errors);
        info!("  Database:");
        info!("    Writes: {}", self.database_writes);
        info!("    Errors: {}", self.database_errors);
        info!("  Channels:");
        for unit in units.power_units() {
            info!("    {}: {}", unit.address, unit.describe_channels());
        }
    }
}

/// Owns the command side: bus commands, scheduled initializations and the
/// channel locks they share.
#[derive(Clone)]
pub struct Coordinator {
    config: ConfigWrapper,
    channels: Channels,
    units: Arc<UnitRegistry>,
    locks: ChannelLocks,
    store: Arc<dyn StateStore>,
    running: RunFlag,
    pub shared_stats: Arc<Mutex<BridgeStats>>,
}

impl Coordinator {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        units: Arc<UnitRegistry>,
        store: Arc<dyn StateStore>,
        running: RunFlag,
    ) -> Self {
        Self {
            locks: ChannelLocks::new(units.channel_addresses()),
            config,
            channels,
            units,
            store,
            running,
            shared_stats: Arc::new(Mutex::new(BridgeStats::default())),
        }
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn units(&self) -> &Arc<UnitRegistry> {
        &self.units
    }

    pub fn locks(&self) -> &ChannelLocks {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn timeouts(&self) -> config::Timeouts {
        self.config.timeouts()
    }

    pub fn stats(&self) -> MutexGuard<'_, BridgeStats> {
        self.shared_stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn power_unit(&self, address: &UnitAddress) -> Result<Arc<PowerUnit>> {
        self.units
            .power_unit(address)
            .ok_or_else(|| anyhow!("{} is not a configured power unit", address))
    }

    /// One reader per configured unit.
    pub fn readers(&self) -> Vec<UnitReader> {
        let power = self.units.power_units().map(|unit| {
            UnitReader::power(unit.clone(), self.channels.clone(), self.shared_stats.clone(), self.running.clone())
        });
        let input = self.units.input_units().map(|unit| {
            UnitReader::input(unit.clone(), self.channels.clone(), self.shared_stats.clone(), self.running.clone())
        });

        power.chain(input).collect()
    }

    pub async fn start(&self) -> Result<()> {
        futures::try_join!(self.mqtt_receiver(), self.internal_receiver())?;

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.from_mqtt.send(mqtt::ChannelData::Shutdown);
        let _ = self.channels.to_coordinator.send(ChannelData::Shutdown);
    }

    // Commands {{{
    pub fn set_channel_state(&self, addr: String, status: String) -> BoxFuture<'static, Result<ChannelState>> {
        let coordinator = self.clone();
        async move { SetChannelState::new(coordinator, addr, status).run().await }.boxed()
    }

    pub fn initialize_unit(&self, unit: UnitAddress) -> BoxFuture<'static, Result<()>> {
        let coordinator = self.clone();
        async move { InitializeUnit::new(coordinator, unit).run().await }.boxed()
    }

    pub fn measure_insulation(&self, addr: String) -> BoxFuture<'static, Result<String>> {
        let coordinator = self.clone();
        async move { MeasureInsulation::new(coordinator, addr).run().await }.boxed()
    }

    pub async fn execute(&self, command: Command) -> Result<()> {
        info!("{} for {}", command.name(), command.addr());

        let result = match command {
            Command::SetChannelState { addr, status } => {
                self.set_channel_state(addr, status).await.map(|_| ())
            }
            Command::MeasureInsulation { addr } => self.measure_insulation(addr).await.map(|_| ()),
        };

        if result.is_ok() {
            self.stats().commands_succeeded += 1;
        } else {
            self.stats().commands_failed += 1;
        }

        result
    } // }}}

    // mqtt -> commands
    async fn mqtt_receiver(&self) -> Result<()> {
        let mut receiver = self.channels.from_mqtt.subscribe();

        while self.running.is_running() {
            let message = match receiver.recv().await {
                Ok(mqtt::ChannelData::Message(message)) => message,
                Ok(mqtt::ChannelData::Shutdown) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("command receiver lagged, {} messages dropped", n);
                    continue;
                }
                Err(err) => bail!("from_mqtt closed: {}", err),
            };

            match message.to_command() {
                Ok(command) => {
                    // each command runs on its own so a slow confirmation
                    // does not hold up the others
                    let coordinator = self.clone();
                    tokio::spawn(async move {
                        let _ = coordinator.execute(command).await;
                    });
                }
                Err(err) => {
                    error!("{}", err);
                    self.stats().commands_failed += 1;
                    self.channels.publish(mqtt::Message::for_failure(&err));
                }
            }
        }

        info!("command receiver exiting");
        Ok(())
    }

    // reader loops -> initialization
    async fn internal_receiver(&self) -> Result<()> {
        let mut receiver = self.channels.to_coordinator.subscribe();

        while self.running.is_running() {
            let unit = match receiver.recv().await {
                Ok(ChannelData::Initialize(unit)) => unit,
                Ok(ChannelData::Shutdown) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("coordinator lagged, {} requests dropped", n);
                    continue;
                }
                Err(err) => bail!("to_coordinator closed: {}", err),
            };

            match self.units.power_unit(&unit) {
                Some(power_unit) if power_unit.is_initializing() => {
                    debug!("{} is already initializing", unit);
                }
                Some(_) => {
                    let coordinator = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = coordinator.initialize_unit(unit).await {
                            error!("{}", err);
                            coordinator
                                .channels
                                .publish(mqtt::Message::for_error(&err.to_string()));
                        }
                    });
                }
                None => warn!("initialization requested for unknown unit {}", unit),
            }
        }

        info!("coordinator loop exiting");
        Ok(())
    }
}
