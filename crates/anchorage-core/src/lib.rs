//! Anchorage Core - Fundamental types for spatial anchors
//!
//! This crate defines the types shared by every Anchorage crate:
//! - Identities (AnchorId)
//! - Poses (Position3D, Rotation3D, Pose)
//! - Session and anchor states
//! - Localization configuration
//! - Anchor payloads
//! - Backend events and the delivery queue

pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod payload;
pub mod pose;
pub mod state;

pub use config::*;
pub use error::*;
pub use event::*;
pub use id::*;
pub use payload::*;
pub use pose::*;
pub use state::*;
