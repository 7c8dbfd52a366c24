//! Anchorage Backends - where localization work actually happens
//!
//! This crate provides:
//! - The backend contract driven by a localization session
//! - A remote VPS backend over a pluggable client
//! - An offline simulator
//! - Resolution rate budgeting

pub mod backend;
pub mod budget;
pub mod remote;
pub mod simulated;

pub use backend::LocalizationBackend;
pub use budget::ResolutionBudget;
pub use remote::{ClientError, RemoteBackend, VpsClient};
pub use simulated::{SimulatedBackend, SimulatorConfig};
