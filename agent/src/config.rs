//! Configuration types for the telemetry agent

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for overrides, e.g.
/// `TELEMETRY_AGENT__DISK_BUFFERING__STORAGE__MAX_FILE_SIZE_BYTES=65536`.
pub const ENV_PREFIX: &str = "TELEMETRY_AGENT";

/// Disk persistence parameters. Applied independently to each signal kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base path for all persisted signal files. When unset the cache storage
    /// directory supplied by the host is used.
    pub root_dir: Option<PathBuf>,

    /// Per-file size cap before rollover
    pub max_file_size_bytes: u64,

    /// Total cap per signal kind before oldest-file eviction
    pub max_folder_size_bytes: u64,

    /// A file stops accepting appends once older than this
    pub max_file_age_for_write_ms: u64,

    /// Files older than this are abandoned instead of delivered
    pub max_file_age_for_read_ms: u64,

    /// Files younger than this are not read yet
    pub min_file_age_for_read_ms: u64,

    /// Verbose diagnostics for the persistence layer
    pub debug_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            max_file_size_bytes: 1024 * 1024,
            max_folder_size_bytes: 20 * 1024 * 1024,
            max_file_age_for_write_ms: 30_000,
            max_file_age_for_read_ms: 18 * 60 * 60 * 1000,
            min_file_age_for_read_ms: 33_000,
            debug_enabled: false,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_file_size_bytes == 0 {
            anyhow::bail!("max_file_size_bytes must be greater than 0");
        }

        if self.max_folder_size_bytes < self.max_file_size_bytes {
            anyhow::bail!(
                "max_folder_size_bytes ({}) must be at least max_file_size_bytes ({})",
                self.max_folder_size_bytes,
                self.max_file_size_bytes
            );
        }

        if self.min_file_age_for_read_ms > self.max_file_age_for_read_ms {
            anyhow::bail!(
                "min_file_age_for_read_ms ({}) must not exceed max_file_age_for_read_ms ({})",
                self.min_file_age_for_read_ms,
                self.max_file_age_for_read_ms
            );
        }

        // A file still open for writing must never look readable.
        if self.min_file_age_for_read_ms <= self.max_file_age_for_write_ms {
            anyhow::bail!(
                "min_file_age_for_read_ms ({}) must be greater than max_file_age_for_write_ms ({})",
                self.min_file_age_for_read_ms,
                self.max_file_age_for_write_ms
            );
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskBufferingConfig {
    /// When false the initializer never touches the disk
    pub enabled: bool,

    pub storage: StorageConfig,
}

impl Default for DiskBufferingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage: StorageConfig::default(),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Reported as `service.name` by the demo exporter
    pub service_name: String,

    pub disk_buffering: DiskBufferingConfig,

    /// How often persisted batches are drained back to the network
    pub drain_interval_ms: u64,

    /// Upper bound on batches read per signal kind in one drain cycle
    pub max_batches_per_drain: usize,

    /// Bound on each pipeline's flush during crash handling
    pub crash_flush_timeout_ms: u64,

    /// Install the process-wide panic hook at build time
    pub install_crash_handler: bool,

    /// Pipelines hand a batch to the exporter once this many records are queued
    pub max_export_batch_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown_service".to_string(),
            disk_buffering: DiskBufferingConfig::default(),
            drain_interval_ms: 10_000,
            max_batches_per_drain: 100,
            crash_flush_timeout_ms: 10_000,
            install_crash_handler: true,
            max_export_batch_size: 512,
        }
    }
}

impl AgentConfig {
    /// Load configuration from defaults, an optional file (format picked from
    /// the extension), then `TELEMETRY_AGENT__*` environment variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&AgentConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: AgentConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn crash_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.crash_flush_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.drain_interval_ms == 0 {
            anyhow::bail!("drain_interval_ms must be greater than 0");
        }

        if self.max_batches_per_drain == 0 {
            anyhow::bail!("max_batches_per_drain must be greater than 0");
        }

        if self.max_export_batch_size == 0 {
            anyhow::bail!("max_export_batch_size must be greater than 0");
        }

        if self.crash_flush_timeout_ms == 0 {
            anyhow::bail!("crash_flush_timeout_ms must be greater than 0");
        }

        if self.disk_buffering.enabled {
            self.disk_buffering.storage.validate()?;
        }

        Ok(())
    }
}
