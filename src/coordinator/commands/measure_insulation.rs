use crate::prelude::*;

use crate::command::InvalidInput;
use crate::coordinator::commands::wait_until;
use crate::coordinator::Coordinator;

/// Resets a power unit and measures the insulation resistance of one
/// channel. The unit is in maintenance for the whole run, so the reset is
/// not mistaken for a reboot.
pub struct MeasureInsulation {
    coordinator: Coordinator,
    addr: String,
}

impl MeasureInsulation {
    pub fn new(coordinator: Coordinator, addr: String) -> Self {
        Self { coordinator, addr }
    }

    pub async fn run(&self) -> Result<String> {
        let result = self.measure().await;

        match &result {
            Ok(value) => info!("insulation of {} is {}", self.addr, value),
            Err(err) => {
                error!("{}", err);
                self.coordinator.channels().publish(mqtt::Message::for_failure(err));
            }
        }

        result
    }

    async fn measure(&self) -> Result<String> {
        let addr = ChannelAddress::from_str(&self.addr).map_err(InvalidInput::wrap)?;
        let unit = self.coordinator.power_unit(&addr.unit).map_err(InvalidInput::wrap)?;
        let timeouts = self.coordinator.timeouts();

        let _maintenance = unit.enter_maintenance();
        unit.snapshot.clear_insulation(addr.position);

        info!("resetting {} for insulation measurement of {}", unit.address, addr);
        if !unit.send(&format!("rst {}", unit.address)).await {
            bail!("cannot measure {}: write to {} failed", addr, unit.port.name());
        }

        let idle = wait_until(timeouts.reset(), timeouts.poll(), || {
            unit.snapshot
                .channel_states()
                .iter()
                .all(|s| *s == Some(ChannelState::Idle))
        })
        .await;
        if !idle {
            bail!(
                "cannot measure {}: {} did not reset within {:?} ({})",
                addr,
                unit.address,
                timeouts.reset(),
                unit.describe_channels()
            );
        }

        let _lock = match self.coordinator.locks().acquire(&addr, timeouts.lock()).await {
            Some(lock) => lock,
            None => bail!("cannot measure {}: blocked by another operation", addr),
        };

        let command = format!("resist start {} {}", addr.position.number(), unit.address);
        if !unit.send(&command).await {
            bail!("cannot measure {}: write to {} failed", addr, unit.port.name());
        }

        let measured = wait_until(timeouts.insulation(), timeouts.poll(), || {
            unit.snapshot.insulation(addr.position).is_some()
        })
        .await;

        match unit.snapshot.insulation(addr.position) {
            Some(value) if measured => Ok(value),
            _ => bail!(
                "cannot measure {}: no reading within {:?}",
                addr,
                timeouts.insulation()
            ),
        }
    }
}
