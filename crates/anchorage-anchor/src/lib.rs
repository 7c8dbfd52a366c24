//! Anchorage Anchors - Spatial anchor entities and the anchor registry
//!
//! This crate implements the anchor side of the localization session:
//! - SpatialAnchor handles with status, pose and tracking flags
//! - Deferred application of pose-carrying statuses
//! - RAII release of backend-side anchor resources
//! - Weak registry guaranteeing one live anchor per identity

pub mod anchor;
pub mod registry;

pub use anchor::*;
pub use registry::*;
