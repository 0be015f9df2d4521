use crate::prelude::*;

use crate::config::Timeouts;
use crate::coordinator::commands::wait_until;
use crate::coordinator::Coordinator;
use crate::unit::PowerUnit;

use std::sync::Arc;

const ATTEMPTS: u32 = 3;

/// Brings a power unit's channels out of idle/unconfigured, then restores
/// channels that were last known to be on.
pub struct InitializeUnit {
    coordinator: Coordinator,
    unit: UnitAddress,
}

impl InitializeUnit {
    pub fn new(coordinator: Coordinator, unit: UnitAddress) -> Self {
        Self { coordinator, unit }
    }

    pub async fn run(&self) -> Result<()> {
        let unit = self.coordinator.power_unit(&self.unit)?;
        let timeouts = self.coordinator.timeouts();
        let _initializing = unit.begin_initialization();

        self.coordinator.stats().initializations_started += 1;
        info!("initializing {}", unit.address);

        let persisted = self.persisted_states(&unit).await;

        let result = match self.coordinator.locks().acquire_unit(&unit.address, timeouts.lock()).await {
            Some(locks) => {
                let result = self.bring_up(&unit, &timeouts).await;
                drop(locks);
                result
            }
            None => self.wait_for_other(&unit, &timeouts).await,
        };

        if let Err(err) = result {
            self.coordinator.stats().initializations_failed += 1;
            return Err(err);
        }

        self.restore(&unit, persisted).await;
        info!("{} initialized: {}", unit.address, unit.describe_channels());

        Ok(())
    }

    async fn persisted_states(&self, unit: &PowerUnit) -> [Option<ChannelState>; 2] {
        let mut states = [None, None];

        for position in ChannelPosition::BOTH {
            let addr = unit.channel(position);
            states[position.index()] = match self.coordinator.store().load(&addr).await {
                Ok(Some(persisted)) => persisted.state(),
                Ok(None) => None,
                Err(err) => {
                    warn!("not restoring {}: {}", addr, err);
                    None
                }
            };
        }

        states
    }

    // Someone else holds a channel, most likely another initialization of
    // the same unit. Succeed if the unit comes up on its watch.
    async fn wait_for_other(&self, unit: &PowerUnit, timeouts: &Timeouts) -> Result<()> {
        info!("{} is busy, waiting for it to come up", unit.address);

        let ready = wait_until(timeouts.lock(), timeouts.poll(), || {
            unit.channels_left(&[ChannelState::Idle, ChannelState::NotConfigured])
        })
        .await;

        if !ready {
            bail!(
                "cannot initialize {}: channels locked by another operation ({})",
                unit.address,
                unit.describe_channels()
            );
        }

        Ok(())
    }

    async fn bring_up(&self, unit: &PowerUnit, timeouts: &Timeouts) -> Result<()> {
        // first contact may be a sample parcel; give the state parcel a moment
        let reported = wait_until(timeouts.lock(), timeouts.poll(), || {
            unit.snapshot.channel_states().iter().all(Option::is_some)
        })
        .await;
        if !reported {
            bail!("cannot initialize {}: no channel state reported", unit.address);
        }

        if unit.any_channel_in(ChannelState::Idle) {
            self.start(unit, timeouts).await?;
        }

        if unit.any_channel_in(ChannelState::NotConfigured) {
            self.configure(unit, timeouts).await?;
        }

        Ok(())
    }

    async fn start(&self, unit: &PowerUnit, timeouts: &Timeouts) -> Result<()> {
        let command = format!("run start {}", unit.address);

        for attempt in 1..=ATTEMPTS {
            info!("starting {} (attempt {}/{})", unit.address, attempt, ATTEMPTS);

            if !unit.send(&command).await {
                warn!("could not send start to {}", unit.address);
                continue;
            }

            let started = wait_until(timeouts.start(), timeouts.poll(), || {
                unit.channels_left(&[ChannelState::Idle, ChannelState::Starting])
            })
            .await;

            if started {
                info!("{} started: {}", unit.address, unit.describe_channels());
                return Ok(());
            }

            warn!(
                "{} did not start within {:?}: {}",
                unit.address,
                timeouts.start(),
                unit.describe_channels()
            );
        }

        bail!(
            "{} failed to start after {} attempts: {}",
            unit.address,
            ATTEMPTS,
            unit.describe_channels()
        )
    }

    async fn configure(&self, unit: &PowerUnit, timeouts: &Timeouts) -> Result<()> {
        let thresholds = unit.config.thresholds()?;
        let commands = [
            thresholds.consumption_command(&unit.address),
            thresholds.leak_command(&unit.address),
        ];

        for attempt in 1..=ATTEMPTS {
            info!("configuring {} (attempt {}/{})", unit.address, attempt, ATTEMPTS);

            let mut sent = true;
            for command in &commands {
                if !unit.send(command).await {
                    warn!("could not send {:?} to {}", command, unit.address);
                    sent = false;
                    break;
                }
                tokio::time::sleep(timeouts.command_gap()).await;
            }
            if !sent {
                continue;
            }

            let configured = wait_until(timeouts.configure(), timeouts.poll(), || {
                unit.channels_left(&[ChannelState::NotConfigured])
            })
            .await;

            if configured {
                info!("{} configured: {}", unit.address, unit.describe_channels());
                return Ok(());
            }

            warn!(
                "{} did not accept thresholds within {:?}: {}",
                unit.address,
                timeouts.configure(),
                unit.describe_channels()
            );
        }

        bail!(
            "{} failed to configure after {} attempts: {}",
            unit.address,
            ATTEMPTS,
            unit.describe_channels()
        )
    }

    async fn restore(&self, unit: &Arc<PowerUnit>, persisted: [Option<ChannelState>; 2]) {
        for position in ChannelPosition::BOTH {
            if persisted[position.index()] != Some(ChannelState::On) {
                continue;
            }

            let addr = unit.channel(position);
            match unit.channel_state(position) {
                Some(state) if state.is_controllable() => {}
                state => {
                    warn!("not restoring {} to on, channel is {:?}", addr, state);
                    continue;
                }
            }

            info!("restoring {} to on", addr);
            if let Err(err) = self
                .coordinator
                .set_channel_state(addr.to_string(), ChannelState::On.status())
                .await
            {
                warn!("could not restore {}: {}", addr, err);
            }
        }
    }
}
