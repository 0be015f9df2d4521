use crate::prelude::*;

pub mod crc8;
pub mod decoder;
pub mod parcel;
pub mod port;
pub mod reader;
pub mod registry;
pub mod snapshot;
pub mod thresholds;

pub use registry::{InputUnit, PowerUnit, UnitRegistry};

use num_enum::FromPrimitive;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// UnitAddress {{{
/// Bus address of one hardware unit, `m` followed by digits (`m1`, `m12`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitAddress(String);

impl UnitAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for UnitAddress {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        match input.strip_prefix('m') {
            Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                Ok(Self(input.to_owned()))
            }
            _ => bail!("{} is not a unit address (expected m<digits>)", input),
        }
    }
}

impl std::fmt::Display for UnitAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for UnitAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for UnitAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UnitAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
} // }}}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Power,
    Input,
}

// ChannelPosition {{{
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelPosition {
    One,
    Two,
}

impl ChannelPosition {
    pub const BOTH: [ChannelPosition; 2] = [ChannelPosition::One, ChannelPosition::Two];

    pub fn index(self) -> usize {
        match self {
            Self::One => 0,
            Self::Two => 1,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

impl FromStr for ChannelPosition {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "1" => Ok(Self::One),
            "2" => Ok(Self::Two),
            _ => bail!("channel position must be 1 or 2, got {}", input),
        }
    }
}

impl std::fmt::Display for ChannelPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
} // }}}

// ChannelAddress {{{
/// `ch:<unit>:<1|2>`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelAddress {
    pub unit: UnitAddress,
    pub position: ChannelPosition,
}

impl ChannelAddress {
    pub fn new(unit: UnitAddress, position: ChannelPosition) -> Self {
        Self { unit, position }
    }

    pub fn both(unit: &UnitAddress) -> [ChannelAddress; 2] {
        ChannelPosition::BOTH.map(|position| Self::new(unit.clone(), position))
    }
}

impl FromStr for ChannelAddress {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        let parts: Vec<&str> = input.split(':').collect();

        match parts[..] {
            ["ch", unit, position] => Ok(Self {
                unit: UnitAddress::from_str(unit)?,
                position: ChannelPosition::from_str(position)?,
            }),
            _ => bail!("{} is not a channel address (expected ch:<unit>:<1|2>)", input),
        }
    }
}

impl std::fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ch:{}:{}", self.unit, self.position)
    }
}

impl std::fmt::Debug for ChannelAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ch:{}:{}", self.unit, self.position)
    }
} // }}}

// ChannelState {{{
/// Channel lifecycle as reported by a power unit in `st` parcels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum ChannelState {
    Idle = 0,
    Starting = 1,
    Fault = 2,
    NotConfigured = 3,
    Off = 4,
    On = 5,
    PowerOff = 6,
    Locked = 7,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl ChannelState {
    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Starting => 1,
            Self::Fault => 2,
            Self::NotConfigured => 3,
            Self::Off => 4,
            Self::On => 5,
            Self::PowerOff => 6,
            Self::Locked => 7,
            Self::Unknown(code) => code,
        }
    }

    /// Parses a wire status such as `"5"`.
    pub fn from_status(status: &str) -> Result<Self> {
        let code: u8 = status
            .trim()
            .parse()
            .map_err(|_| anyhow!("{:?} is not a channel status code", status))?;

        Ok(Self::from(code))
    }

    pub fn status(self) -> String {
        self.code().to_string()
    }

    pub fn needs_initialization(self) -> bool {
        matches!(self, Self::Idle | Self::NotConfigured)
    }

    /// States an on/off command may be written in.
    pub fn accepts_switch(self) -> bool {
        matches!(self, Self::Starting | Self::Off | Self::On)
    }

    pub fn is_controllable(self) -> bool {
        matches!(self, Self::Off | Self::On)
    }

    /// States a channel cannot be switched out of by command.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fault | Self::PowerOff | Self::Locked)
    }

    pub fn is_persistent(self) -> bool {
        self.is_controllable() || self.is_terminal()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Fault => "fault",
            Self::NotConfigured => "nuse",
            Self::Off => "off",
            Self::On => "on",
            Self::PowerOff => "poff",
            Self::Locked => "lock",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown({})", code),
            _ => write!(f, "{}", self.name()),
        }
    }
} // }}}
