use crate::prelude::*;

use crate::unit::port::RunFlag;
use crate::unit::UnitRegistry;

use std::sync::Arc;

/// Publishes telemetry for every unit on a fixed interval.
#[derive(Clone)]
pub struct Scheduler {
    config: ConfigWrapper,
    channels: Channels,
    units: Arc<UnitRegistry>,
    running: RunFlag,
}

impl Scheduler {
    pub fn new(config: ConfigWrapper, channels: Channels, units: Arc<UnitRegistry>, running: RunFlag) -> Self {
        Self {
            config,
            channels,
            units,
            running,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let telemetry = self.config.telemetry();
        let mut interval = tokio::time::interval(telemetry.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.running.is_running() {
            interval.tick().await;
            self.publish_once(telemetry.nominal_voltage())?;
        }

        info!("scheduler exiting");
        Ok(())
    }

    pub fn publish_once(&self, nominal_voltage: f64) -> Result<usize> {
        let messages = crate::telemetry::collect(&self.units, nominal_voltage, crate::telemetry::timestamp())?;
        let count = messages.len();

        for message in messages {
            self.channels.publish(message);
        }

        trace!("published {} telemetry messages", count);
        Ok(count)
    }
}
