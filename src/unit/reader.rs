use crate::prelude::*;

use crate::coordinator::BridgeStats;
use crate::database::PersistedChannelState;
use crate::unit::parcel::{Parcel, ParcelBody, ParcelParser};
use crate::unit::port::{RunFlag, SerialPortChannel};
use crate::unit::snapshot::CounterVerdict;
use crate::unit::{InputUnit, PowerUnit};

use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub enum Source {
    Power(Arc<PowerUnit>),
    Input(Arc<InputUnit>),
}

/// Turns the frames of one unit into snapshot updates and bus events.
/// The only writer of that unit's snapshot.
#[derive(Clone)]
pub struct UnitReader {
    source: Source,
    parser: ParcelParser,
    channels: Channels,
    shared_stats: Arc<Mutex<BridgeStats>>,
    running: RunFlag,
}

impl UnitReader {
    pub fn power(
        unit: Arc<PowerUnit>,
        channels: Channels,
        shared_stats: Arc<Mutex<BridgeStats>>,
        running: RunFlag,
    ) -> Self {
        Self {
            parser: ParcelParser::new(unit.address.clone(), UnitKind::Power),
            source: Source::Power(unit),
            channels,
            shared_stats,
            running,
        }
    }

    pub fn input(
        unit: Arc<InputUnit>,
        channels: Channels,
        shared_stats: Arc<Mutex<BridgeStats>>,
        running: RunFlag,
    ) -> Self {
        Self {
            parser: ParcelParser::new(unit.address.clone(), UnitKind::Input),
            source: Source::Input(unit),
            channels,
            shared_stats,
            running,
        }
    }

    pub fn address(&self) -> &UnitAddress {
        match &self.source {
            Source::Power(unit) => &unit.address,
            Source::Input(unit) => &unit.address,
        }
    }

    fn port(&self) -> &SerialPortChannel {
        match &self.source {
            Source::Power(unit) => &unit.port,
            Source::Input(unit) => &unit.port,
        }
    }

    pub async fn run(&self) -> Result<()> {
        info!("reading {} on {}", self.address(), self.port().name());

        let frames = self.port().read_stream(self.running.clone());
        futures::pin_mut!(frames);

        while let Some(frame) = frames.next().await {
            self.handle_frame(&frame);
        }

        info!("reader for {} exiting", self.address());
        Ok(())
    }

    pub fn handle_frame(&self, frame: &[u8]) {
        let parcel = match self.parser.parse(frame) {
            Some(parcel) => parcel,
            None => {
                self.stats().parcels_dropped += 1;
                debug!("{}: dropped {:?}", self.address(), String::from_utf8_lossy(frame));
                return;
            }
        };

        self.stats().parcels_received += 1;
        trace!("{}: {:?}", self.address(), parcel);

        match &self.source {
            Source::Power(unit) => self.power_parcel(unit, parcel),
            Source::Input(unit) => self.input_parcel(unit, parcel),
        }
    }

    // Power unit {{{
    fn power_parcel(&self, unit: &PowerUnit, parcel: Parcel) {
        let kind = parcel.kind();
        let mut scheduled = false;

        if let (true, Some(counter)) = (kind.is_counted(), parcel.counter) {
            match unit.snapshot.check_counter(kind, counter, unit.in_maintenance()) {
                CounterVerdict::FirstContact => {
                    info!("first contact with {}", unit.address);
                    scheduled = self.schedule_initialization(&unit.address);
                }
                CounterVerdict::Reboot { previous } => {
                    error!(
                        "{}: counter 0 after {} on {:?} parcel, module rebooted",
                        unit.address, previous, kind
                    );
                    self.stats().reboots_detected += 1;
                    scheduled = self.schedule_initialization(&unit.address);
                }
                CounterVerdict::Healthy => {}
            }
            unit.snapshot.record_counter(kind, counter);
        }

        match parcel.body {
            ParcelBody::PowerState { states, signals } => {
                self.apply_state(unit, states, signals);

                // a manual reset leaves the channels idle without a counter restart
                if !scheduled
                    && states.contains(&ChannelState::Idle)
                    && parcel.counter != Some(0)
                    && !unit.in_maintenance()
                    && !unit.is_initializing()
                {
                    info!("{} reports idle channels, initializing", unit.address);
                    self.schedule_initialization(&unit.address);
                }
            }
            ParcelBody::Current { current } => unit.snapshot.set_current(current),
            ParcelBody::Load { load, angle } => unit.snapshot.set_load(load, angle),
            ParcelBody::Temperature { temperature } => unit.snapshot.set_temperature(temperature),
            ParcelBody::Insulation { position, value } => {
                let addr = unit.channel(position);
                info!("insulation of {}: {}", addr, value);
                self.channels.publish(mqtt::Message::for_insulation(&addr, &value));
                unit.snapshot.set_insulation(position, value);
            }
            ParcelBody::Reply { text } => info!("{} replied: {}", unit.address, text),
            body => debug!("{}: unexpected {:?}", unit.address, body),
        }
    }

    fn apply_state(&self, unit: &PowerUnit, states: [ChannelState; 2], signals: [u16; 2]) {
        for transition in unit.snapshot.apply_state(states, signals) {
            let addr = unit.channel(transition.position);

            match transition.previous {
                Some(previous) => info!("{} {} -> {}", addr, previous, transition.current),
                None => info!("{} is {}", addr, transition.current),
            }

            match mqtt::Message::for_state(&addr, transition.current) {
                Ok(message) => self.channels.publish(message),
                Err(err) => warn!("cannot encode state of {}: {}", addr, err),
            }

            if transition.current.is_persistent() {
                let state = PersistedChannelState::new(transition.current);
                if self
                    .channels
                    .to_database
                    .send(database::ChannelData::StateChanged(addr, state))
                    .is_err()
                {
                    trace!("no database writer listening");
                }
            }
        }
    }

    fn schedule_initialization(&self, unit: &UnitAddress) -> bool {
        let sent = self
            .channels
            .to_coordinator
            .send(coordinator::ChannelData::Initialize(unit.clone()))
            .is_ok();

        if !sent {
            warn!("cannot schedule initialization of {}: coordinator not listening", unit);
        }

        sent
    } // }}}

    // Input unit {{{
    fn input_parcel(&self, unit: &InputUnit, parcel: Parcel) {
        let kind = parcel.kind();

        if let (true, Some(counter)) = (kind.is_counted(), parcel.counter) {
            match unit.snapshot.check_counter(kind, counter) {
                CounterVerdict::FirstContact => info!("first contact with {}", unit.address),
                CounterVerdict::Reboot { previous } => {
                    warn!("{}: counter 0 after {} on {:?} parcel, module rebooted", unit.address, previous, kind);
                    self.stats().reboots_detected += 1;
                }
                CounterVerdict::Healthy => {}
            }
            unit.snapshot.record_counter(kind, counter);
        }

        match parcel.body {
            ParcelBody::InputState { state, signal } => unit.snapshot.set_state(state, signal),
            ParcelBody::Voltage { vin, frequency } => unit.snapshot.set_voltage(vin, frequency),
            ParcelBody::InputCurrent { iin, iout, iypr } => unit.snapshot.set_current(iin, iout, iypr),
            ParcelBody::Reply { text } => info!("{} replied: {}", unit.address, text),
            body => debug!("{}: unexpected {:?}", unit.address, body),
        }
    } // }}}

    fn stats(&self) -> MutexGuard<'_, BridgeStats> {
        self.shared_stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::parcel::ParcelKind;
    use crate::unit::port::{Connector, SerialIo};
    use crate::unit::snapshot::COUNTER_SENTINEL;
    use async_trait::async_trait;

    struct Unplugged;

    #[async_trait]
    impl Connector for Unplugged {
        async fn connect(&self) -> Result<Box<dyn SerialIo>> {
            bail!("unplugged")
        }

        fn describe(&self) -> String {
            "unplugged".to_owned()
        }
    }

    fn power_reader() -> (UnitReader, Arc<PowerUnit>, Channels) {
        let config = Config::from_yaml(
            r#"
mqtt: { enabled: false, host: localhost }
power_units:
  - { address: m1, port: /dev/null, max_consumption_current: [10.0, 10.0], max_leak_current: [0.01, 0.01] }
input_units:
  - { address: m9, port: /dev/null }
"#,
        )
        .unwrap();
        let unit = Arc::new(PowerUnit::new(
            config.power_units[0].clone(),
            Box::new(Unplugged),
            &config::Timeouts::default(),
        ));
        let channels = Channels::new();
        let reader = UnitReader::power(
            unit.clone(),
            channels.clone(),
            Arc::new(Mutex::new(BridgeStats::default())),
            RunFlag::new(),
        );

        (reader, unit, channels)
    }

    #[test]
    fn first_contact_schedules_initialization() {
        let (reader, unit, channels) = power_reader();
        let mut to_coordinator = channels.to_coordinator.subscribe();

        reader.handle_frame(b"tmpr 30 31 17m1");

        assert_eq!(
            to_coordinator.try_recv().unwrap(),
            coordinator::ChannelData::Initialize(unit.address.clone())
        );
        assert!(to_coordinator.try_recv().is_err());
        assert_eq!(unit.snapshot.counter(ParcelKind::Temperature), Some(17));
        assert_eq!(unit.snapshot.counter(ParcelKind::State), Some(COUNTER_SENTINEL));
        assert_eq!(unit.snapshot.state().temperature, Some([30, 31]));
    }

    #[test]
    fn reboot_schedules_one_initialization() {
        let (reader, unit, channels) = power_reader();
        reader.handle_frame(b"st 4 4 0 0 100m1");
        reader.handle_frame(b"adc 1.5 0.0 100m1");

        let mut to_coordinator = channels.to_coordinator.subscribe();
        reader.handle_frame(b"adc 0.0 0.0 0m1");
        reader.handle_frame(b"st 4 4 0 0 0m1");

        assert_eq!(
            to_coordinator.try_recv().unwrap(),
            coordinator::ChannelData::Initialize(unit.address.clone())
        );
        assert!(to_coordinator.try_recv().is_err());
        assert_eq!(reader.stats().reboots_detected, 1);
    }

    #[test]
    fn state_changes_are_published_and_persisted() {
        let (reader, unit, channels) = power_reader();
        let mut to_mqtt = channels.to_mqtt.subscribe();
        let mut to_database = channels.to_database.subscribe();

        reader.handle_frame(b"st 4 4 0 0 1m1");
        reader.handle_frame(b"st 5 4 0 0 2m1");

        let published: Vec<String> = std::iter::from_fn(|| to_mqtt.try_recv().ok())
            .filter_map(|m| match m {
                mqtt::ChannelData::Message(m) if m.topic == "info/state" => Some(m.payload),
                _ => None,
            })
            .collect();
        assert_eq!(
            published,
            vec![
                r#"{"addr":"ch:m1:1","state":{"status":"4"}}"#,
                r#"{"addr":"ch:m1:2","state":{"status":"4"}}"#,
                r#"{"addr":"ch:m1:1","state":{"status":"5"}}"#,
            ]
        );

        let mut persisted = Vec::new();
        while let Ok(database::ChannelData::StateChanged(addr, state)) = to_database.try_recv() {
            persisted.push((addr.to_string(), state.status));
        }
        assert_eq!(persisted.len(), 3);
        assert_eq!(persisted[2], ("ch:m1:1".to_owned(), "5".to_owned()));

        assert_eq!(unit.channel_state(ChannelPosition::One), Some(ChannelState::On));
    }

    #[test]
    fn idle_channels_outside_maintenance_schedule_initialization() {
        let (reader, unit, channels) = power_reader();
        reader.handle_frame(b"st 4 4 0 0 1m1");

        let mut to_coordinator = channels.to_coordinator.subscribe();
        {
            let _maintenance = unit.enter_maintenance();
            reader.handle_frame(b"st 0 0 0 0 2m1");
        }
        assert!(to_coordinator.try_recv().is_err());

        reader.handle_frame(b"st 0 0 0 0 3m1");
        assert!(to_coordinator.try_recv().is_ok());

        let _initializing = unit.begin_initialization();
        reader.handle_frame(b"st 0 0 0 0 4m1");
        assert!(to_coordinator.try_recv().is_err());
    }

    #[test]
    fn insulation_reply_fills_slot() {
        let (reader, unit, channels) = power_reader();
        let mut to_mqtt = channels.to_mqtt.subscribe();

        reader.handle_frame(b"rply isol ch2 1500 7m1");

        assert_eq!(unit.snapshot.insulation(ChannelPosition::Two).as_deref(), Some("1500"));
        assert_eq!(
            to_mqtt.try_recv().unwrap(),
            mqtt::ChannelData::Message(mqtt::Message::for_insulation(&unit.channel(ChannelPosition::Two), "1500"))
        );
    }

    #[test]
    fn garbage_is_counted_and_dropped() {
        let (reader, unit, _) = power_reader();

        reader.handle_frame(b"st 4 4 0 0 1m2");
        reader.handle_frame(b"hello");

        assert_eq!(reader.stats().parcels_dropped, 2);
        assert_eq!(unit.channel_state(ChannelPosition::One), None);
    }
}
