//! In-process execution units
//!
//! Capability policy, per-unit output capture, and the deadline-enforcing task manager.

pub mod capture;
pub mod security;
pub mod task_manager;
