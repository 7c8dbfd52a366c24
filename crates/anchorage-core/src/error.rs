//! Error types for anchors and localization sessions

use std::time::Duration;

use thiserror::Error;

use crate::{AnchorId, AnchorStatus, LocalizationState};

/// Core errors
///
/// Call-scoped errors are returned synchronously and never mutate shared
/// state. Session-scoped failures surface through a `Failed` state change;
/// `Timeout` is returned as well to callers that explicitly wait.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VpsError {
    // Call-scoped
    #[error("Invalid prerequisite: {0}")]
    InvalidPrerequisite(String),

    #[error("Not localized: session is {state}")]
    NotLocalized { state: LocalizationState },

    #[error("Anchor already exists: {0}")]
    AlreadyExists(AnchorId),

    #[error("Anchor {id} not ready: status {status:?}")]
    NotReady { id: AnchorId, status: AnchorStatus },

    #[error("Unknown anchor: {0}")]
    UnknownAnchor(AnchorId),

    #[error("Session already active: {0}")]
    SessionActive(LocalizationState),

    #[error("Invalid pose: {0}")]
    InvalidPose(String),

    // Configuration / payload
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid payload: expected {expected} bytes, got {actual}")]
    InvalidPayload { expected: usize, actual: usize },

    // Session-scoped
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Localization backend unavailable")]
    BackendUnavailable,

    #[error("Backend error: {0}")]
    Backend(String),
}

impl VpsError {
    /// Errors that only affect the failing call
    pub fn is_call_scoped(&self) -> bool {
        matches!(
            self,
            VpsError::InvalidPrerequisite(_)
                | VpsError::NotLocalized { .. }
                | VpsError::AlreadyExists(_)
                | VpsError::NotReady { .. }
                | VpsError::UnknownAnchor(_)
                | VpsError::SessionActive(_)
                | VpsError::InvalidPose(_)
                | VpsError::InvalidConfig(_)
                | VpsError::InvalidPayload { .. }
        )
    }
}

/// Result type for anchor and session operations
pub type VpsResult<T> = Result<T, VpsError>;
