use crate::prelude::*;

/// Requests arriving from the automation bus. Addresses and statuses are kept
/// as received; the executor validates them before touching any hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetChannelState { addr: String, status: String },
    MeasureInsulation { addr: String },
}

impl Command {
    pub fn addr(&self) -> &str {
        use Command::*;

        match self {
            SetChannelState { addr, .. } | MeasureInsulation { addr } => addr,
        }
    }

    pub fn name(&self) -> &'static str {
        use Command::*;

        match self {
            SetChannelState { .. } => "set channel state",
            MeasureInsulation { .. } => "measure insulation",
        }
    }
}

/// A request refused before any serial traffic: bad address, unknown unit,
/// unsupported status or an unreadable bus payload.
#[derive(Debug)]
pub struct InvalidInput(pub String);

impl InvalidInput {
    pub fn wrap(err: anyhow::Error) -> anyhow::Error {
        anyhow::Error::new(Self(err.to_string()))
    }

    pub fn is(err: &anyhow::Error) -> bool {
        err.downcast_ref::<Self>().is_some()
    }
}

impl std::fmt::Display for InvalidInput {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for InvalidInput {}
