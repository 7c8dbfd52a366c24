//! Localization and anchor state definitions
//!
//! A session moves through [`LocalizationState`]; every anchor carries its
//! own [`AnchorStatus`]. The two are independent: an anchor may stay
//! `Pending` across a whole stop/start cycle of its session.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session-scoped localization state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum LocalizationState {
    Initializing = 0x01,
    Localizing = 0x02,
    Localized = 0x03,
    Failed = 0x04,
    #[default]
    Stopped = 0x05,
}

impl LocalizationState {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(LocalizationState::Initializing),
            0x02 => Some(LocalizationState::Localizing),
            0x03 => Some(LocalizationState::Localized),
            0x04 => Some(LocalizationState::Failed),
            0x05 => Some(LocalizationState::Stopped),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Session is running against the backend (start was accepted)
    pub fn is_active(self) -> bool {
        matches!(
            self,
            LocalizationState::Initializing
                | LocalizationState::Localizing
                | LocalizationState::Localized
        )
    }

    /// An attempt to localize is in flight
    pub fn is_attempting(self) -> bool {
        matches!(
            self,
            LocalizationState::Initializing | LocalizationState::Localizing
        )
    }

    /// Whether the backend may move the session from `self` to `next`.
    ///
    /// `Failed` and `Stopped` are always reachable. Leaving `Stopped` or
    /// `Failed` only happens through `start`, never through a backend event.
    pub fn permits(self, next: LocalizationState, continuous: bool) -> bool {
        use LocalizationState::*;
        match (self, next) {
            (_, Failed) | (_, Stopped) => true,
            (Stopped, Initializing) | (Failed, Initializing) => true,
            (Initializing, Localizing) | (Initializing, Localized) => true,
            (Localizing, Localized) => true,
            (Localized, Localizing) => continuous,
            _ => false,
        }
    }
}

impl fmt::Display for LocalizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LocalizationState::Initializing => "initializing",
            LocalizationState::Localizing => "localizing",
            LocalizationState::Localized => "localized",
            LocalizationState::Failed => "failed",
            LocalizationState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why a session failed or was stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum FailureReason {
    #[default]
    None = 0x00,
    NetworkError = 0x01,
    LocalizationFailed = 0x02,
    Timeout = 0x03,
    SpaceFailure = 0x04,
    Canceled = 0x05,
    Unknown = 0xFF,
}

impl FailureReason {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => FailureReason::None,
            0x01 => FailureReason::NetworkError,
            0x02 => FailureReason::LocalizationFailed,
            0x03 => FailureReason::Timeout,
            0x04 => FailureReason::SpaceFailure,
            0x05 => FailureReason::Canceled,
            _ => FailureReason::Unknown,
        }
    }

    /// Reason a stop carries given the state it interrupts
    pub fn for_stop(interrupted: LocalizationState) -> Self {
        if interrupted.is_attempting() {
            FailureReason::Canceled
        } else {
            FailureReason::None
        }
    }
}

/// Per-anchor status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum AnchorStatus {
    /// Pose is undefined
    #[default]
    Pending = 0x00,
    /// Localized against the VPS
    Success = 0x01,
    /// Degraded (non-VPS) localization; pose is valid but coarse
    Limited = 0x02,
    Failed = 0x03,
    Invalid = 0x04,
}

impl AnchorStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(AnchorStatus::Pending),
            0x01 => Some(AnchorStatus::Success),
            0x02 => Some(AnchorStatus::Limited),
            0x03 => Some(AnchorStatus::Failed),
            0x04 => Some(AnchorStatus::Invalid),
            _ => None,
        }
    }

    /// Statuses that assert a meaningful pose. These are the only ones
    /// that may be deferred until the anchor has a handle and a pose.
    #[inline]
    pub fn carries_pose(self) -> bool {
        matches!(self, AnchorStatus::Success | AnchorStatus::Limited)
    }

    /// Terminal for the current creation/resolution attempt
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, AnchorStatus::Failed | AnchorStatus::Invalid)
    }
}

/// Snapshot of a session's state, as published to watchers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub state: LocalizationState,
    pub reason: FailureReason,
}

impl SessionStatus {
    pub fn new(state: LocalizationState, reason: FailureReason) -> Self {
        SessionStatus { state, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_byte_roundtrip() {
        for state in [
            LocalizationState::Initializing,
            LocalizationState::Localizing,
            LocalizationState::Localized,
            LocalizationState::Failed,
            LocalizationState::Stopped,
        ] {
            assert_eq!(LocalizationState::from_byte(state.to_byte()), Some(state));
        }
        assert_eq!(LocalizationState::from_byte(0x42), None);
    }

    #[test]
    fn test_relocalize_requires_continuous() {
        let s = LocalizationState::Localized;
        assert!(!s.permits(LocalizationState::Localizing, false));
        assert!(s.permits(LocalizationState::Localizing, true));
    }

    #[test]
    fn test_backend_cannot_leave_stopped() {
        let s = LocalizationState::Stopped;
        assert!(!s.permits(LocalizationState::Localizing, true));
        assert!(!s.permits(LocalizationState::Localized, true));
        assert!(s.permits(LocalizationState::Failed, false));
    }

    #[test]
    fn test_stop_reason() {
        assert_eq!(
            FailureReason::for_stop(LocalizationState::Localizing),
            FailureReason::Canceled
        );
        assert_eq!(
            FailureReason::for_stop(LocalizationState::Localized),
            FailureReason::None
        );
    }

    #[test]
    fn test_status_classes() {
        assert!(AnchorStatus::Success.carries_pose());
        assert!(AnchorStatus::Limited.carries_pose());
        assert!(!AnchorStatus::Pending.carries_pose());
        assert!(AnchorStatus::Invalid.is_terminal());
        assert_eq!(FailureReason::from_byte(0x77), FailureReason::Unknown);
    }
}
