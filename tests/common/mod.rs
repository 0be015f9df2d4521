#![allow(dead_code)]

pub use axiom_bridge::prelude::*;

use async_trait::async_trait;
use axiom_bridge::coordinator::Coordinator;
use axiom_bridge::database::{MemoryStore, StateStore};
use axiom_bridge::unit::port::{Connector, RunFlag, SerialIo};
use axiom_bridge::unit::{PowerUnit, UnitRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory();
impl Factory {
    /// Two power units (m1 linked to input unit m9, m2 standalone) with
    /// every timeout shortened.
    pub fn config_yaml() -> String {
        r#"
mqtt:
  enabled: false
  host: localhost
timeouts:
  lock_ms: 300
  start_ms: 400
  configure_ms: 300
  switch_ms: 300
  reset_ms: 300
  insulation_ms: 300
  write_lock_ms: 300
  read_ms: 20
  command_gap_ms: 5
  poll_ms: 5
  supervisor_ms: 50
power_units:
  - address: m1
    port: mock://m1
    max_consumption_current: [16.0, 16.0]
    max_leak_current: [0.03, 0.03]
    input_unit: m9
  - address: m2
    port: mock://m2
    max_consumption_current: [10.0, 10.0]
    max_leak_current: [0.01, 0.01]
input_units:
  - address: m9
    port: mock://m9
"#
        .to_owned()
    }

    pub fn config() -> Config {
        Config::from_yaml(&Self::config_yaml()).unwrap()
    }

    pub fn addr(s: &str) -> ChannelAddress {
        ChannelAddress::from_str(s).unwrap()
    }

    pub fn unit(s: &str) -> UnitAddress {
        UnitAddress::from_str(s).unwrap()
    }
}

// StreamConnector {{{
/// Hands out one end of an in-memory pipe, once.
pub struct StreamConnector {
    stream: Mutex<Option<DuplexStream>>,
    name: String,
}

impl StreamConnector {
    pub fn new(name: &str, stream: DuplexStream) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            name: name.to_owned(),
        }
    }
}

#[async_trait]
impl Connector for StreamConnector {
    async fn connect(&self) -> Result<Box<dyn SerialIo>> {
        match self.stream.lock().unwrap().take() {
            Some(stream) => Ok(Box::new(stream)),
            None => bail!("{} already connected", self.name),
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
} // }}}

// MockUnit {{{
#[derive(Debug, Clone)]
pub struct MockBehaviour {
    pub states: [u8; 2],
    pub counter: u32,
    /// `rst` is recorded but the channels never go idle
    pub ignore_reset: bool,
    /// `ch` commands are recorded but the state does not change
    pub ignore_switch: bool,
    /// `run start` is recorded but the channels stay idle
    pub ignore_start: bool,
    /// state a switched channel ends up in instead of the requested one
    pub switch_to: Option<u8>,
    pub insulation: String,
}

impl Default for MockBehaviour {
    fn default() -> Self {
        Self {
            states: [4, 4],
            counter: 1,
            ignore_reset: false,
            ignore_switch: false,
            ignore_start: false,
            switch_to: None,
            insulation: "1500".to_owned(),
        }
    }
}

/// Plays the hardware side of one power unit: records every command line
/// and answers with the `st` parcels a real unit would send.
#[derive(Clone)]
pub struct MockUnit {
    pub address: String,
    writer: Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>,
    behaviour: Arc<Mutex<MockBehaviour>>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl MockUnit {
    pub fn spawn(address: &str, stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let unit = Self {
            address: address.to_owned(),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            behaviour: Arc::new(Mutex::new(MockBehaviour::default())),
            commands: Arc::new(Mutex::new(Vec::new())),
        };

        let task = unit.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                task.commands.lock().unwrap().push(line.clone());
                task.react(&line).await;
            }
        });

        unit
    }

    pub fn configure(&self, f: impl FnOnce(&mut MockBehaviour)) {
        f(&mut self.behaviour.lock().unwrap());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_starting(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn clear_commands(&self) {
        self.commands.lock().unwrap().clear();
    }

    pub async fn send_line(&self, line: &str) {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\r\n").await.unwrap();
        writer.flush().await.unwrap();
    }

    fn next_counter(&self) -> u32 {
        let mut behaviour = self.behaviour.lock().unwrap();
        let counter = behaviour.counter;
        behaviour.counter += 1;
        counter
    }

    /// Sends the current channel states as an `st` parcel.
    pub async fn announce(&self) {
        let states = self.behaviour.lock().unwrap().states;
        let counter = self.next_counter();
        self.send_line(&format!(
            "st {} {} 0 0 {}{}",
            states[0], states[1], counter, self.address
        ))
        .await;
    }

    pub async fn announce_with_counter(&self, counter: u32) {
        self.configure(|b| b.counter = counter);
        self.announce().await;
    }

    async fn react(&self, line: &str) {
        let words: Vec<&str> = line.split_whitespace().collect();

        let changed = {
            let mut b = self.behaviour.lock().unwrap();
            match words[..] {
                ["run", "start", _] if !b.ignore_start => {
                    for s in b.states.iter_mut().filter(|s| **s == 0 || **s == 1) {
                        *s = 3;
                    }
                    true
                }
                ["adc", "hlgrp", ..] => {
                    for s in b.states.iter_mut().filter(|s| **s == 3) {
                        *s = 4;
                    }
                    true
                }
                ["ch", n, word, _] if !b.ignore_switch => {
                    let i = if n == "1" { 0 } else { 1 };
                    b.states[i] = b.switch_to.unwrap_or(if word == "on" { 5 } else { 4 });
                    true
                }
                ["rst", _] if !b.ignore_reset => {
                    b.states = [0, 0];
                    true
                }
                _ => false,
            }
        };

        if changed {
            self.announce().await;
        }

        if let ["resist", "start", n, _] = words[..] {
            let value = self.behaviour.lock().unwrap().insulation.clone();
            let counter = self.next_counter();
            self.send_line(&format!("rply isol ch{} {} {}{}", n, value, counter, self.address))
                .await;
        }
    }
} // }}}

// Harness {{{
pub struct Harness {
    pub config: ConfigWrapper,
    pub channels: Channels,
    pub running: RunFlag,
    pub units: Arc<UnitRegistry>,
    pub store: Arc<MemoryStore>,
    pub coordinator: Coordinator,
    pub mocks: HashMap<String, MockUnit>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(Factory::config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let config = ConfigWrapper::from_config(config);
        let channels = Channels::new();
        let running = RunFlag::new();

        let mut mocks = HashMap::new();
        let units = Arc::new(UnitRegistry::with_connectors(&config, |port, _| {
            let (bridge_end, unit_end) = tokio::io::duplex(4096);
            let address = port.trim_start_matches("mock://");
            mocks.insert(address.to_owned(), MockUnit::spawn(address, unit_end));
            Box::new(StreamConnector::new(port, bridge_end)) as Box<dyn Connector>
        }));
        units.open_all().await;

        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(
            config.clone(),
            channels.clone(),
            units.clone(),
            store.clone() as Arc<dyn StateStore>,
            running.clone(),
        );

        Self {
            config,
            channels,
            running,
            units,
            store,
            coordinator,
            mocks,
        }
    }

    pub fn mock(&self, address: &str) -> &MockUnit {
        &self.mocks[address]
    }

    pub fn power_unit(&self, address: &str) -> Arc<PowerUnit> {
        self.units.power_unit(&Factory::unit(address)).unwrap()
    }

    pub fn start_readers(&self) {
        for reader in self.coordinator.readers() {
            tokio::spawn(async move { reader.run().await });
        }
    }

    pub fn start_coordinator(&self) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move { coordinator.start().await });
    }

    /// Announces `states` from the mock and waits until the snapshot shows them.
    pub async fn set_states(&self, address: &str, states: [u8; 2]) {
        let mock = self.mock(address);
        mock.configure(|b| b.states = states);
        mock.announce().await;

        let unit = self.power_unit(address);
        let expected = [
            Some(ChannelState::from(states[0])),
            Some(ChannelState::from(states[1])),
        ];
        assert!(
            wait_for(Duration::from_secs(1), || unit.snapshot.channel_states() == expected).await,
            "{} never reported {:?}",
            address,
            states
        );
    }

    pub fn stop(&self) {
        self.running.stop();
        self.coordinator.stop();
    }
} // }}}

pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Every message queued for the bus so far.
pub fn drain_bus(receiver: &mut broadcast::Receiver<mqtt::ChannelData>) -> Vec<mqtt::Message> {
    let mut messages = Vec::new();
    while let Ok(data) = receiver.try_recv() {
        if let mqtt::ChannelData::Message(message) = data {
            messages.push(message);
        }
    }
    messages
}

pub fn on_topic(messages: &[mqtt::Message], topic: &str) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.topic == topic)
        .map(|m| m.payload.clone())
        .collect()
}

pub fn state_event(addr: &str, status: &str) -> String {
    format!(r#"{{"addr":"{}","state":{{"status":"{}"}}}}"#, addr, status)
}
