use clap::Parser;

/// Bridges power and input units on serial links to an MQTT bus.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Options {
    /// YAML config file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Stop after this many seconds instead of waiting for ctrl-c
    #[arg(short = 't', long = "time")]
    pub runtime: Option<u64>,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}
