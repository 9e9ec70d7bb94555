//! gradebox: resource-limited execution of untrusted submissions
//!
//! Runs student-submitted code, either as native programs under a
//! limit-applying wrapper or as in-process units under a capability policy,
//! and always returns a bounded, well-formed result: no matter whether the
//! code hangs, crashes, floods its output or tries forbidden operations.
//!
//! # Architecture
//!
//! ## Bounded Stream Filters ([`utils`])
//! - [`utils::limited_input`]: byte-capped reader
//! - [`utils::output`]: line/byte/character-capped output collector
//! - [`utils::prefix`]: sandbox banner stripper
//!
//! ## Configuration ([`config`])
//! - [`config::limits`]: command limits, preferences, wrapper flags
//! - [`config::loader`]: builder configuration file and env overrides
//! - [`config::types`]: statuses, results, error taxonomy
//!
//! ## Execution Control ([`exec`])
//! - [`exec::wrapper`]: wrapper script and native wrapper setup
//! - [`exec::runner`]: external process runner and cross-thread kill
//! - [`exec::status`]: wrapper status file and signal classification
//! - [`exec::input`]: stdin writer
//! - [`exec::command`]: per-input command executor with deadlines
//!
//! ## In-process Units ([`runtime`])
//! - [`runtime::security`]: capability policy for untrusted units
//! - [`runtime::task_manager`]: batch execution under one deadline
//! - [`runtime::capture`]: per-unit stdout/stderr capture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::rlimit`]: setrlimit in the native wrapper's child
//! - [`kernel::signal`]: SIGTERM forwarding in the native wrapper
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured security events

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// In-process Units
pub mod runtime;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint for the gradebox binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
