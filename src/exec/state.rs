//! Container state as seen by API callers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::PowerState;
use crate::error::Error;

/// Externally visible container state.
///
/// ```text
///   Created ──start──► Running ──stop──► Stopped
///                         ▲                 │
///                         └──────start──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    /// VM exists but the container has never run.
    Created,
    /// VM is powered on.
    Running,
    /// VM is powered off after having run.
    Stopped,
}

impl State {
    /// Derives the state from the backend power state and whether any session
    /// has ever reported a launch.
    #[must_use]
    pub fn from_power(power: PowerState, started: bool) -> Self {
        match power {
            PowerState::PoweredOn => Self::Running,
            PowerState::PoweredOff | PowerState::Suspended if !started => Self::Created,
            PowerState::PoweredOff | PowerState::Suspended => Self::Stopped,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "STOPPED" => Ok(Self::Stopped),
            _ => Err(Error::InvalidState(s.to_string())),
        }
    }
}
