//! Shared types and utilities for the telemetry agent
//!
//! This crate contains the signal record types (spans, log records, metric
//! points), the signal-kind taxonomy, and the binary envelope used to persist
//! batches on disk.

pub mod protocol;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::signals::*;
