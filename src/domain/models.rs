use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Operating modes the device can be put in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    CoolLow,
    CoolMid,
    CoolHigh,
    CoolRapid,
    HotLow,
    HotMid,
    HotHigh,
}

impl Mode {
    pub const ALL: [Mode; 7] = [
        Mode::CoolLow,
        Mode::CoolMid,
        Mode::CoolHigh,
        Mode::CoolRapid,
        Mode::HotLow,
        Mode::HotMid,
        Mode::HotHigh,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::CoolLow => "cool_low",
            Self::CoolMid => "cool_mid",
            Self::CoolHigh => "cool_high",
            Self::CoolRapid => "cool_rapid",
            Self::HotLow => "hot_low",
            Self::HotMid => "hot_mid",
            Self::HotHigh => "hot_high",
        }
    }

    /// Register value the device reports while in this mode
    pub fn value(&self) -> u16 {
        protocol::mode_to_value(*self)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mode '{0}'")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

/// Snapshot of the device registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub enabled: bool,
    pub mode_value: u16,
}

impl DeviceState {
    /// Named mode for the current mode value
    pub fn mode(&self) -> Option<Mode> {
        protocol::value_to_mode(self.mode_value)
    }
}

/// Where a cached state came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOrigin {
    /// Read back from the device
    Confirmed,
    /// Written locally after a command, not yet read back
    Tentative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedState {
    pub state: DeviceState,
    pub origin: StateOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    StateUpdated(CachedState),
    UpdateFailed(String),
    PollingChanged(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names_round_trip() {
        for mode in Mode::ALL {
            assert_eq!(mode.name().parse::<Mode>(), Ok(mode));
            assert_eq!(mode.to_string(), mode.name());
        }
        assert!("warm".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_serde_uses_names() {
        let json = serde_json::to_string(&Mode::CoolRapid).unwrap();
        assert_eq!(json, "\"cool_rapid\"");
        let mode: Mode = serde_json::from_str("\"hot_mid\"").unwrap();
        assert_eq!(mode, Mode::HotMid);
    }

    #[test]
    fn test_state_mode_lookup() {
        let state = DeviceState {
            enabled: true,
            mode_value: 0x0004,
        };
        assert_eq!(state.mode(), Some(Mode::CoolHigh));
        assert_eq!(DeviceState::default().mode(), None);
        assert_eq!(
            DeviceState {
                enabled: false,
                mode_value: 0x1234
            }
            .mode(),
            None
        );
    }
}
