//! Configuration
//!
//! Shared types, resource limits, and the builder configuration file.

pub mod limits;
pub mod loader;
pub mod types;
