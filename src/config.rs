use crate::prelude::*;

use crate::unit::port::{PortTimeouts, DEFAULT_BAUD_RATE};
use crate::unit::thresholds::Thresholds;

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Vec::new")]
    pub power_units: Vec<PowerUnit>,
    #[serde(default = "Vec::new")]
    pub input_units: Vec<InputUnit>,

    pub mqtt: Mqtt,
    pub database: Option<Database>,

    #[serde(default)]
    pub telemetry: Telemetry,
    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// PowerUnit {{{
#[derive(Clone, Debug, Deserialize)]
pub struct PowerUnit {
    pub address: UnitAddress,
    pub port: String,
    pub baud_rate: Option<u32>,

    /// amps per channel before the unit trips on consumption
    pub max_consumption_current: [f64; 2],
    /// amps per channel before the unit trips on leakage
    pub max_leak_current: [f64; 2],

    /// input unit whose frequency is reported alongside this unit's metrics
    pub input_unit: Option<UnitAddress>,
}
impl PowerUnit {
    pub fn address(&self) -> &UnitAddress {
        &self.address
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.unwrap_or(DEFAULT_BAUD_RATE)
    }

    pub fn thresholds(&self) -> Result<Thresholds> {
        Thresholds::new(self.max_consumption_current, self.max_leak_current)
    }

    pub fn input_unit(&self) -> Option<&UnitAddress> {
        self.input_unit.as_ref()
    }
} // }}}

// InputUnit {{{
#[derive(Clone, Debug, Deserialize)]
pub struct InputUnit {
    pub address: UnitAddress,
    pub port: String,
    pub baud_rate: Option<u32>,
}
impl InputUnit {
    pub fn address(&self) -> &UnitAddress {
        &self.address
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.unwrap_or(DEFAULT_BAUD_RATE)
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,
}
impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
} // }}}

// Database {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Database {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub url: String,
}
impl Database {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn url(&self) -> &str {
        &self.url
    }
} // }}}

// Telemetry {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Telemetry {
    #[serde(default = "Config::default_telemetry_interval")]
    pub interval_secs: u64,
    #[serde(default = "Config::default_nominal_voltage")]
    pub nominal_voltage: f64,
}
impl Default for Telemetry {
    fn default() -> Self {
        Self {
            interval_secs: Config::default_telemetry_interval(),
            nominal_voltage: Config::default_nominal_voltage(),
        }
    }
}
impl Telemetry {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn nominal_voltage(&self) -> f64 {
        self.nominal_voltage
    }
} // }}}

// Timeouts {{{
/// Every bounded wait in the bridge, in milliseconds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub lock_ms: u64,
    pub start_ms: u64,
    pub configure_ms: u64,
    pub switch_ms: u64,
    pub reset_ms: u64,
    pub insulation_ms: u64,
    pub write_lock_ms: u64,
    pub read_ms: u64,
    pub command_gap_ms: u64,
    pub poll_ms: u64,
    pub supervisor_ms: u64,
}
impl Default for Timeouts {
    fn default() -> Self {
        Self {
            lock_ms: 3000,
            start_ms: 10000,
            configure_ms: 3000,
            switch_ms: 2000,
            reset_ms: 10000,
            insulation_ms: 3000,
            write_lock_ms: 3000,
            read_ms: 100,
            command_gap_ms: 500,
            poll_ms: 10,
            supervisor_ms: 5000,
        }
    }
}
impl Timeouts {
    pub fn lock(&self) -> Duration {
        Duration::from_millis(self.lock_ms)
    }

    pub fn start(&self) -> Duration {
        Duration::from_millis(self.start_ms)
    }

    pub fn configure(&self) -> Duration {
        Duration::from_millis(self.configure_ms)
    }

    pub fn switch(&self) -> Duration {
        Duration::from_millis(self.switch_ms)
    }

    pub fn reset(&self) -> Duration {
        Duration::from_millis(self.reset_ms)
    }

    pub fn insulation(&self) -> Duration {
        Duration::from_millis(self.insulation_ms)
    }

    /// pause after each threshold command
    pub fn command_gap(&self) -> Duration {
        Duration::from_millis(self.command_gap_ms)
    }

    /// interval between snapshot checks while waiting on the hardware
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn supervisor(&self) -> Duration {
        Duration::from_millis(self.supervisor_ms)
    }

    pub fn port(&self) -> PortTimeouts {
        PortTimeouts {
            lock: Duration::from_millis(self.write_lock_ms),
            read: Duration::from_millis(self.read_ms),
        }
    }
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn config(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn power_units(&self) -> Vec<PowerUnit> {
        self.config().power_units.clone()
    }

    pub fn input_units(&self) -> Vec<InputUnit> {
        self.config().input_units.clone()
    }

    pub fn mqtt(&self) -> Mqtt {
        self.config().mqtt.clone()
    }

    pub fn database(&self) -> Option<Database> {
        self.config().database.clone()
    }

    pub fn enabled_database(&self) -> Option<Database> {
        self.database().filter(|d| d.enabled())
    }

    pub fn telemetry(&self) -> Telemetry {
        self.config().telemetry.clone()
    }

    pub fn timeouts(&self) -> Timeouts {
        self.config().timeouts.clone()
    }
}

impl Config {
    /// Loads and validates without logging, for use before the logger is up.
    pub fn read(file: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    pub fn log_summary(&self) {
        let config = self;

        info!("Configuration loaded successfully:");
        info!("  Power units: {}", config.power_units.len());
        for unit in &config.power_units {
            info!("    {}:", unit.address);
            info!("      Port: {} @ {}", unit.port, unit.baud_rate());
            info!("      Max consumption: {:?} A", unit.max_consumption_current);
            info!("      Max leak: {:?} A", unit.max_leak_current);
            if let Some(input_unit) = &unit.input_unit {
                info!("      Input unit: {}", input_unit);
            }
        }
        info!("  Input units: {}", config.input_units.len());
        for unit in &config.input_units {
            info!("    {}: {} @ {}", unit.address, unit.port, unit.baud_rate());
        }

        info!("  MQTT: {}", if config.mqtt.enabled { "enabled" } else { "disabled" });
        if config.mqtt.enabled {
            info!("    Host: {}", config.mqtt.host);
            info!("    Port: {}", config.mqtt.port);
            info!("    Namespace: {}", config.mqtt.namespace);
        }

        match &config.database {
            Some(db) if db.enabled => info!("  Database: {}", db.url),
            _ => info!("  Database: disabled, channel state kept in memory"),
        }

        info!("  Telemetry every {}s", config.telemetry.interval_secs);
        info!("  Log Level: {}", config.loglevel);
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("mqtt.host cannot be empty");
            }
            if self.mqtt.namespace.is_empty() {
                bail!("mqtt.namespace cannot be empty");
            }
        }

        if let Some(db) = &self.database {
            if db.enabled && !db.url.starts_with("sqlite:") {
                bail!("database.url must be a sqlite: url, got {}", db.url);
            }
        }

        if self.telemetry.interval_secs == 0 {
            bail!("telemetry.interval_secs must be at least 1");
        }

        let mut seen = HashSet::new();
        let addresses = self
            .power_units
            .iter()
            .map(|u| (&u.address, &u.port))
            .chain(self.input_units.iter().map(|u| (&u.address, &u.port)));
        for (address, port) in addresses {
            if !seen.insert(address) {
                bail!("unit {} is configured more than once", address);
            }
            if port.is_empty() {
                bail!("unit {} has no port", address);
            }
        }

        let input_units: HashSet<&UnitAddress> =
            self.input_units.iter().map(|u| &u.address).collect();
        for unit in &self.power_units {
            unit.thresholds()
                .map_err(|err| anyhow!("power unit {}: {}", unit.address, err))?;

            if let Some(input_unit) = &unit.input_unit {
                if !input_units.contains(input_unit) {
                    bail!(
                        "power unit {} is linked to input unit {} which is not configured",
                        unit.address,
                        input_unit
                    );
                }
            }
        }

        Ok(())
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "axiom".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_telemetry_interval() -> u64 {
        10
    }

    fn default_nominal_voltage() -> f64 {
        220.0
    }
}
