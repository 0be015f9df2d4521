pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::str::FromStr;
pub use tokio::sync::broadcast;

pub use crate::{
    channels::Channels,
    command::Command,
    config::{self, Config, ConfigWrapper},
    coordinator, database, mqtt, options::Options, unit,
    unit::{ChannelAddress, ChannelPosition, ChannelState, UnitAddress, UnitKind},
};
