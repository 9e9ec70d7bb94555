//! Execution control
//!
//! Wrapper setup, the external process runner, and the per-input command executor.

pub mod command;
pub mod input;
pub mod runner;
pub mod status;
pub mod wrapper;
