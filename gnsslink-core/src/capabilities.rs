//! Receiver capability types.
//!
//! A capability is a logical output category that consumers subscribe to.
//! Which wire messages feed a capability, and how their fields map onto
//! canonical names, is described by the schema catalog.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical output category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Position,
    Velocity,
    Heading,
    Satellites,
    Imu,
    Time,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Position,
        Capability::Velocity,
        Capability::Heading,
        Capability::Satellites,
        Capability::Imu,
        Capability::Time,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Position => "position",
            Capability::Velocity => "velocity",
            Capability::Heading => "heading",
            Capability::Satellites => "satellites",
            Capability::Imu => "imu",
            Capability::Time => "time",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == lower)
            .ok_or_else(|| format!("unknown capability '{}'", s))
    }
}
