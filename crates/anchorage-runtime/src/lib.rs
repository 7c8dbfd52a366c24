//! Anchorage Runtime - Localization session and service
//!
//! This crate drives the anchor lifecycle:
//! 1. Validate start prerequisites (config, pose source, backend)
//! 2. Funnel backend callbacks through one delivery queue
//! 3. Apply state changes, creations, statuses and poses in arrival order
//! 4. Publish changes to anchor observers and session subscribers
//! 5. Fail runs that miss the localization deadline

pub mod observability;
pub mod pose_source;
pub mod service;
pub mod session;

pub use observability::{init_logging, InitError, LogFormat, LOG_ENV};
pub use pose_source::{PoseSource, StaticPoseSource};
pub use service::LocalizationService;
pub use session::*;
