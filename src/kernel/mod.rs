//! Thin wrappers around process-level kernel primitives used by the native wrapper.

pub mod rlimit;
pub mod signal;
