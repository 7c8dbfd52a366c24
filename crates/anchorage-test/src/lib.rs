//! Anchorage Test Harness - Scripted backends and session scenarios
//!
//! This crate provides:
//! - A scripted backend that journals every call and injects events in
//!   any order
//! - A harness wiring it to a localization service
//! - Randomized event streams checked against the session invariants
//! - End-to-end lifecycle scenarios

pub mod event_fuzzer;
pub mod integration;
pub mod scripted;

pub use event_fuzzer::*;
pub use integration::*;
pub use scripted::*;
