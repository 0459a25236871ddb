//! Device and action state enumerations
//!
//! `DeviceState` gates the audio paths and drives the display;
//! `ActionState` has an independent lifecycle and is executed by the
//! action runner. Both are written only under the application's state
//! lock.

use std::fmt;

/// Top-level device lifecycle state
///
/// Transitions: Unknown → Starting → {WifiConfiguring | Idle} →
/// Connecting → {Listening ⇄ Speaking} → Idle; any state → Upgrading
/// (terminal until reboot); any state → FatalError (terminal except
/// explicit recovery).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unknown,
    Starting,
    WifiConfiguring,
    Idle,
    Connecting,
    Listening,
    Speaking,
    Upgrading,
    FatalError,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::WifiConfiguring => "wifi_configuring",
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Upgrading => "upgrading",
            Self::FatalError => "fatal_error",
        };
        write!(f, "{}", name)
    }
}

/// Physical gesture the pet body is performing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Walk,
    Sleep,
    Stand,
    SitDown,
    WalkBack,
    TurnLeft,
    TurnRight,
    Wave,
    Stop,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Walk => "walk",
            Self::Sleep => "sleep",
            Self::Stand => "stand",
            Self::SitDown => "sit_down",
            Self::WalkBack => "walk_back",
            Self::TurnLeft => "turn_left",
            Self::TurnRight => "turn_right",
            Self::Wave => "wave",
            Self::Stop => "stop",
        };
        write!(f, "{}", name)
    }
}
