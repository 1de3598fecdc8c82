//! Status enums shared by the DirectPV resources

use crate::error::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Drive health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DriveHealth {
    #[default]
    Ready,
    Lost,
    Moving,
    Error,
}

impl fmt::Display for DriveHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveHealth::Ready => write!(f, "Ready"),
            DriveHealth::Lost => write!(f, "Lost"),
            DriveHealth::Moving => write!(f, "Moving"),
            DriveHealth::Error => write!(f, "Error"),
        }
    }
}

/// Administrative state of a drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DriveState {
    #[default]
    Ready,
    InUse,
    Available,
    Unavailable,
    Terminating,
    Released,
}

impl fmt::Display for DriveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveState::Ready => write!(f, "Ready"),
            DriveState::InUse => write!(f, "InUse"),
            DriveState::Available => write!(f, "Available"),
            DriveState::Unavailable => write!(f, "Unavailable"),
            DriveState::Terminating => write!(f, "Terminating"),
            DriveState::Released => write!(f, "Released"),
        }
    }
}

/// User-assigned access tier of a drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum AccessTier {
    Hot,
    Warm,
    Cold,
    #[default]
    Unknown,
}

impl AccessTier {
    /// Tiers a user may request
    pub const SELECTABLE: [AccessTier; 3] = [AccessTier::Hot, AccessTier::Warm, AccessTier::Cold];
}

impl fmt::Display for AccessTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessTier::Hot => write!(f, "Hot"),
            AccessTier::Warm => write!(f, "Warm"),
            AccessTier::Cold => write!(f, "Cold"),
            AccessTier::Unknown => write!(f, "Unknown"),
        }
    }
}

impl FromStr for AccessTier {
    type Err = Error;

    /// Case-insensitive parse; non-ASCII input is rejected outright.
    fn from_str(value: &str) -> Result<Self> {
        if !value.is_ascii() {
            return Err(Error::InvalidArgument(format!(
                "unknown access-tier value {value:?}"
            )));
        }
        match value.to_ascii_lowercase().as_str() {
            "hot" => Ok(AccessTier::Hot),
            "warm" => Ok(AccessTier::Warm),
            "cold" => Ok(AccessTier::Cold),
            "unknown" => Ok(AccessTier::Unknown),
            _ => Err(Error::InvalidArgument(format!(
                "unknown access-tier value {value:?}"
            ))),
        }
    }
}

/// Volume status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum VolumeState {
    #[default]
    Pending,
    Ready,
    Copying,
    Error,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeState::Pending => write!(f, "Pending"),
            VolumeState::Ready => write!(f, "Ready"),
            VolumeState::Copying => write!(f, "Copying"),
            VolumeState::Error => write!(f, "Error"),
        }
    }
}

/// InitRequest status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum InitStatus {
    #[default]
    Pending,
    Processed,
    Error,
}

impl fmt::Display for InitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStatus::Pending => write!(f, "Pending"),
            InitStatus::Processed => write!(f, "Processed"),
            InitStatus::Error => write!(f, "Error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_tier_parse() {
        assert_eq!("hot".parse::<AccessTier>().unwrap(), AccessTier::Hot);
        assert_eq!("WARM".parse::<AccessTier>().unwrap(), AccessTier::Warm);
        assert_eq!("Cold".parse::<AccessTier>().unwrap(), AccessTier::Cold);
        assert!("lukewarm".parse::<AccessTier>().is_err());
        assert!("hót".parse::<AccessTier>().is_err());
    }

    #[test]
    fn test_enum_serde_names() {
        assert_eq!(
            serde_json::to_string(&DriveState::InUse).unwrap(),
            "\"InUse\""
        );
        assert_eq!(
            serde_json::from_str::<AccessTier>("\"Unknown\"").unwrap(),
            AccessTier::Unknown
        );
        assert_eq!(format!("{}", VolumeState::Copying), "Copying");
    }
}
