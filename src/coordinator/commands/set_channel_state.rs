use crate::prelude::*;

use crate::command::InvalidInput;
use crate::coordinator::commands::wait_until;
use crate::coordinator::Coordinator;
use crate::unit::PowerUnit;

use std::sync::Arc;

/// Switches one channel on or off and waits for the unit to confirm.
pub struct SetChannelState {
    coordinator: Coordinator,
    addr: String,
    status: String,
}

impl SetChannelState {
    pub fn new(coordinator: Coordinator, addr: String, status: String) -> Self {
        Self {
            coordinator,
            addr,
            status,
        }
    }

    pub async fn run(&self) -> Result<ChannelState> {
        let result = self.switch().await;
        self.finish(&result);
        result
    }

    fn validate(&self) -> Result<(Arc<PowerUnit>, ChannelAddress, ChannelState)> {
        let addr = ChannelAddress::from_str(&self.addr)?;
        let unit = self.coordinator.power_unit(&addr.unit)?;

        let desired = ChannelState::from_status(&self.status)?;
        if !desired.is_controllable() {
            bail!(
                "cannot set {} to status {:?}: only {} (off) and {} (on) are accepted",
                addr,
                self.status,
                ChannelState::Off.code(),
                ChannelState::On.code()
            );
        }

        Ok((unit, addr, desired))
    }

    async fn switch(&self) -> Result<ChannelState> {
        let (unit, addr, desired) = self.validate().map_err(InvalidInput::wrap)?;
        let position = addr.position;
        let timeouts = self.coordinator.timeouts();

        let mut current = match unit.channel_state(position) {
            Some(state) => state,
            None => bail!("cannot set {} {}: unit has not reported", addr, desired),
        };

        if current.needs_initialization() {
            info!("{} is {}, initializing {} first", addr, current, unit.address);

            if let Err(err) = self.coordinator.initialize_unit(unit.address.clone()).await {
                bail!(
                    "cannot set {} {}: initialization failed ({}), channel is {}",
                    addr,
                    desired,
                    err,
                    Self::describe(unit.channel_state(position))
                );
            }

            current = match unit.channel_state(position) {
                Some(state) => state,
                None => bail!("cannot set {} {}: unit has not reported", addr, desired),
            };
        }

        if !current.accepts_switch() {
            bail!("cannot set {} {}: channel is {}", addr, desired, current);
        }

        if current == desired {
            info!("{} already {}", addr, desired);
            return Ok(current);
        }

        let _lock = match self.coordinator.locks().acquire(&addr, timeouts.lock()).await {
            Some(lock) => lock,
            None => bail!("cannot set {} {}: blocked by another operation", addr, desired),
        };

        let n = position.number();
        let word = Self::word(desired);

        if !unit.send(&format!("ch {} {} {}", n, word, unit.address)).await {
            bail!("cannot set {} {}: write to {} failed", addr, desired, unit.port.name());
        }

        let settled = wait_until(timeouts.switch(), timeouts.poll(), || {
            matches!(unit.channel_state(position), Some(s) if s == desired || s.is_terminal())
        })
        .await;

        match unit.channel_state(position) {
            Some(state) if settled && state == desired => {
                unit.send(&format!("led inst {} {} {}", n, word, unit.address)).await;
                Ok(state)
            }
            Some(state) if settled && state.is_terminal() => {
                unit.send(&format!("led inst {} off {}", n, unit.address)).await;
                bail!("cannot set {} {}: channel went {}", addr, desired, state)
            }
            state => bail!(
                "cannot set {} {}: no confirmation within {:?}, channel is {}",
                addr,
                desired,
                timeouts.switch(),
                Self::describe(state)
            ),
        }
    }

    fn finish(&self, result: &Result<ChannelState>) {
        if let Ok(addr) = ChannelAddress::from_str(&self.addr) {
            let state = self
                .coordinator
                .units()
                .power_unit(&addr.unit)
                .and_then(|unit| unit.channel_state(addr.position));

            if let Some(state) = state {
                match mqtt::Message::for_state(&addr, state) {
                    Ok(message) => self.coordinator.channels().publish(message),
                    Err(err) => warn!("cannot encode state of {}: {}", addr, err),
                }
            }
        }

        match result {
            Ok(state) => info!("{} is {}", self.addr, state),
            Err(err) => {
                error!("{}", err);
                self.coordinator.channels().publish(mqtt::Message::for_failure(err));
            }
        }
    }

    fn word(state: ChannelState) -> &'static str {
        if state == ChannelState::On {
            "on"
        } else {
            "off"
        }
    }

    fn describe(state: Option<ChannelState>) -> String {
        match state {
            Some(state) => state.to_string(),
            None => "not reported".to_owned(),
        }
    }
}
