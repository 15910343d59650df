//! Error types for the agent library.

use std::path::PathBuf;
use telemetry_shared::protocol::wire::CodecError;
use thiserror::Error;

/// Failures of the on-disk buffer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage directory {path} is not accessible: {source}")]
    Inaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache storage unavailable: {0}")]
    CacheUnavailable(String),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Failures surfaced by an exporter.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("export failed: {0}")]
    Failed(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("a delegate exporter is already attached")]
    AlreadyAttached,

    #[error("exporter is shut down")]
    Shutdown,

    #[error("background task failed: {0}")]
    Task(String),
}

/// Failures building the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(#[from] anyhow::Error),

    #[error("no tokio runtime available to run background initialization")]
    NoRuntime,
}
