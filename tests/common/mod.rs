//! Shared helpers for the integration test crates.

pub mod fixtures;
