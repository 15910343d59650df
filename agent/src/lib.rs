//! Telemetry Agent Library
//!
//! Client-side core of a telemetry agent: the trace, log and metric pipelines
//! are built synchronously and start accepting records right away, while the
//! real exporters (and the disk buffer in front of them) are set up on a
//! background task. Nothing emitted during that window is lost, and a panic
//! hook flushes every pipeline before the process dies.

pub mod config;
pub mod crash;
pub mod drain;
pub mod error;
pub mod export;
pub mod initializer;
pub mod metrics;
pub mod periodic;
pub mod pipeline;
pub mod storage;

pub use config::{AgentConfig, DiskBufferingConfig, StorageConfig};
pub use error::{AgentError, ExportError, StorageError};
pub use export::{Exporter, SharedExporter};
pub use initializer::ExporterFactory;
pub use pipeline::SignalPipeline;
pub use telemetry_shared::{LogRecordData, MetricData, Severity, SignalKind, SpanData};

use crash::CrashFlushCoordinator;
use drain::DiskDrainScheduler;
use export::LoggingExporterFactory;
use initializer::{Customizers, Delegates, ExporterInitializer};
use periodic::{PeriodicWork, TokioPeriodicWork};
use pipeline::ForceFlush;
use std::sync::Arc;
use storage::{CacheStorage, Clock, DirectoryCacheStorage, SystemClock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info};

/// Host name reported with exported batches, falling back to the PID.
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("pid-{}", std::process::id()))
}

/// Progress of the background exporter setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Pending,
    Ready { disk_buffering: bool },
    /// The exporters could not be built; records stay buffered in memory.
    Failed,
}

pub struct TelemetryAgentBuilder {
    config: AgentConfig,
    factory: Option<Arc<dyn ExporterFactory>>,
    cache_storage: Option<Arc<dyn CacheStorage>>,
    periodic: Option<Arc<dyn PeriodicWork>>,
    clock: Arc<dyn Clock>,
    customizers: Customizers,
}

impl TelemetryAgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            factory: None,
            cache_storage: None,
            periodic: None,
            clock: Arc::new(SystemClock),
            customizers: Customizers::default(),
        }
    }

    /// Network exporters. Defaults to logging every batch as JSON.
    pub fn with_exporter_factory(mut self, factory: Arc<dyn ExporterFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_cache_storage(mut self, cache_storage: Arc<dyn CacheStorage>) -> Self {
        self.cache_storage = Some(cache_storage);
        self
    }

    /// Drive the disk drain from the host's scheduler instead of a tokio ticker.
    pub fn with_periodic_work(mut self, periodic: Arc<dyn PeriodicWork>) -> Self {
        self.periodic = Some(periodic);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn add_span_exporter_customizer<F>(mut self, customizer: F) -> Self
    where
        F: Fn(SharedExporter<SpanData>) -> SharedExporter<SpanData> + Send + Sync + 'static,
    {
        self.customizers.spans.push(Box::new(customizer));
        self
    }

    pub fn add_log_exporter_customizer<F>(mut self, customizer: F) -> Self
    where
        F: Fn(SharedExporter<LogRecordData>) -> SharedExporter<LogRecordData> + Send + Sync + 'static,
    {
        self.customizers.logs.push(Box::new(customizer));
        self
    }

    pub fn add_metric_exporter_customizer<F>(mut self, customizer: F) -> Self
    where
        F: Fn(SharedExporter<MetricData>) -> SharedExporter<MetricData> + Send + Sync + 'static,
    {
        self.customizers.metrics.push(Box::new(customizer));
        self
    }

    /// Build the pipelines and return immediately. Exporter setup continues in
    /// the background; the factory and the disk stores run on the blocking pool.
    pub fn build(self) -> Result<TelemetryAgent, AgentError> {
        self.config.validate()?;
        let handle = Handle::try_current().map_err(|_| AgentError::NoRuntime)?;

        let delegates = Delegates::new();
        let batch_size = self.config.max_export_batch_size;
        let spans = Arc::new(SignalPipeline::<SpanData>::new(delegates.spans.clone(), batch_size, &handle));
        let logs = Arc::new(SignalPipeline::<LogRecordData>::new(delegates.logs.clone(), batch_size, &handle));
        let metrics = Arc::new(SignalPipeline::<MetricData>::new(delegates.metrics.clone(), batch_size, &handle));

        let periodic: Arc<dyn PeriodicWork> = match self.periodic {
            Some(periodic) => periodic,
            None => Arc::new(TokioPeriodicWork::new(handle.clone())),
        };
        let scheduler = DiskDrainScheduler::new(
            periodic,
            self.config.drain_interval(),
            self.config.max_batches_per_drain,
        );

        let crash = if self.config.install_crash_handler {
            let pipelines = vec![
                spans.clone() as Arc<dyn ForceFlush>,
                logs.clone(),
                metrics.clone(),
            ];
            Some(CrashFlushCoordinator::new(pipelines, self.config.crash_flush_timeout()).install())
        } else {
            None
        };

        let factory: Arc<dyn ExporterFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(LoggingExporterFactory::new(&self.config.service_name)),
        };
        let cache_storage: Arc<dyn CacheStorage> = match self.cache_storage {
            Some(cache_storage) => cache_storage,
            None => Arc::new(DirectoryCacheStorage::system_default()),
        };

        let initializer = ExporterInitializer {
            factory,
            customizers: self.customizers,
            disk: self.config.disk_buffering.clone(),
            cache_storage,
            clock: self.clock,
            delegates,
            scheduler: scheduler.clone(),
        };
        let (state_tx, ready) = watch::channel(InitState::Pending);
        let setup = handle.spawn(initializer.run());
        handle.spawn(async move {
            let state = match setup.await {
                Ok(Ok(outcome)) => InitState::Ready {
                    disk_buffering: outcome.disk_buffering,
                },
                Ok(Err(e)) => {
                    error!(
                        "exporter initialization failed, records stay buffered in memory: {:#}",
                        e
                    );
                    InitState::Failed
                }
                Err(e) => {
                    error!("exporter initialization task died: {}", e);
                    InitState::Failed
                }
            };
            let _ = state_tx.send(state);
        });

        info!("telemetry agent started for {}", self.config.service_name);
        Ok(TelemetryAgent {
            spans,
            logs,
            metrics,
            scheduler,
            ready,
            crash,
        })
    }
}

pub struct TelemetryAgent {
    spans: Arc<SignalPipeline<SpanData>>,
    logs: Arc<SignalPipeline<LogRecordData>>,
    metrics: Arc<SignalPipeline<MetricData>>,
    scheduler: Arc<DiskDrainScheduler>,
    ready: watch::Receiver<InitState>,
    crash: Option<Arc<CrashFlushCoordinator>>,
}

impl TelemetryAgent {
    pub fn builder(config: AgentConfig) -> TelemetryAgentBuilder {
        TelemetryAgentBuilder::new(config)
    }

    pub fn spans(&self) -> &Arc<SignalPipeline<SpanData>> {
        &self.spans
    }

    pub fn logs(&self) -> &Arc<SignalPipeline<LogRecordData>> {
        &self.logs
    }

    pub fn metrics(&self) -> &Arc<SignalPipeline<MetricData>> {
        &self.metrics
    }

    pub fn drain_scheduler(&self) -> &Arc<DiskDrainScheduler> {
        &self.scheduler
    }

    pub fn crash_coordinator(&self) -> Option<&Arc<CrashFlushCoordinator>> {
        self.crash.as_ref()
    }

    pub fn init_state(&self) -> InitState {
        *self.ready.borrow()
    }

    /// Wait for the background exporter setup to finish.
    pub async fn wait_until_ready(&self) -> InitState {
        let mut ready = self.ready.clone();
        let state = match ready.wait_for(|state| *state != InitState::Pending).await {
            Ok(state) => *state,
            Err(_) => InitState::Failed,
        };
        state
    }

    pub fn disk_buffering_active(&self) -> bool {
        matches!(
            self.init_state(),
            InitState::Ready {
                disk_buffering: true
            }
        )
    }

    pub async fn force_flush(&self) -> Result<(), ExportError> {
        self.spans.force_flush().await?;
        self.logs.force_flush().await?;
        self.metrics.force_flush().await
    }

    /// Stop draining, then flush and shut down every pipeline. All three are
    /// attempted; the first error is returned.
    pub async fn shutdown(&self) -> Result<(), ExportError> {
        self.scheduler.disable();
        let results = [
            self.spans.shutdown().await,
            self.logs.shutdown().await,
            self.metrics.shutdown().await,
        ];
        info!("telemetry agent shut down");
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory_config() -> AgentConfig {
        AgentConfig {
            install_crash_handler: false,
            disk_buffering: DiskBufferingConfig {
                enabled: false,
                ..DiskBufferingConfig::default()
            },
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_host_name_is_not_empty() {
        assert!(!host_name().is_empty());
    }

    #[test]
    fn test_build_requires_runtime() {
        let result = TelemetryAgent::builder(in_memory_config()).build();
        assert!(matches!(result, Err(AgentError::NoRuntime)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = AgentConfig {
            max_export_batch_size: 0,
            ..in_memory_config()
        };
        let result = tokio_test::block_on(async { TelemetryAgent::builder(config).build().map(|_| ()) });
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_ready_without_disk() {
        tokio_test::block_on(async {
            let agent = TelemetryAgent::builder(in_memory_config()).build().unwrap();
            assert_eq!(
                agent.wait_until_ready().await,
                InitState::Ready {
                    disk_buffering: false
                }
            );
            assert!(!agent.disk_buffering_active());
            assert!(agent.crash_coordinator().is_none());
            agent.shutdown().await.unwrap();
        });
    }
}
