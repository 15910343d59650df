//! Disk persistence for signal batches
//!
//! [`DiskBufferStore`] holds one signal kind's queue of buffer files. The host
//! provides the base directory through [`CacheStorage`]; file ages are measured
//! with a [`Clock`] so the read/write windows can be driven in tests.

pub mod disk;

pub use disk::{BufferFile, DiskBufferStore, StoredFrame};

use crate::error::StorageError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Subdirectory of the cache directory used when `root_dir` is not configured.
pub const DEFAULT_STORAGE_SUBDIR: &str = "telemetry-buffer";

/// Host collaborator exposing a writable cache directory.
pub trait CacheStorage: Send + Sync {
    fn cache_dir(&self) -> Result<PathBuf, StorageError>;
}

/// Cache storage backed by a fixed directory.
#[derive(Debug, Clone)]
pub struct DirectoryCacheStorage {
    dir: PathBuf,
}

impl DirectoryCacheStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$TMPDIR/telemetry-agent`
    pub fn system_default() -> Self {
        Self::new(std::env::temp_dir().join("telemetry-agent"))
    }
}

impl CacheStorage for DirectoryCacheStorage {
    fn cache_dir(&self) -> Result<PathBuf, StorageError> {
        Ok(self.dir.clone())
    }
}

/// Wall clock in milliseconds since the UNIX epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        telemetry_shared::utils::time::system_time_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
