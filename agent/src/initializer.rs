//! Background construction of the real exporters.
//!
//! [`ExporterInitializer::run`] executes once, off the caller's thread. It builds
//! the network exporters, tries to open the three disk stores, wires either the
//! persisting or the plain exporters into the [`DelegatingExporter`]s and arms
//! or disarms the drain accordingly.

use crate::config::DiskBufferingConfig;
use crate::drain::{DiskDrainReader, DiskDrainScheduler, DrainSource};
use crate::error::StorageError;
use crate::export::{
    apply_customizers, DelegatingExporter, ExporterCustomizer, PersistingExporter, ReplayReport,
    SharedExporter,
};
use crate::storage::{CacheStorage, Clock, DiskBufferStore};
use anyhow::Context;
use std::sync::Arc;
use telemetry_shared::{LogRecordData, MetricData, SignalKind, SpanData};
use tracing::{error, info, warn};

/// Host seam constructing the network exporters. Called once, on a blocking
/// pool thread.
pub trait ExporterFactory: Send + Sync {
    fn span_exporter(&self) -> anyhow::Result<SharedExporter<SpanData>>;

    fn log_exporter(&self) -> anyhow::Result<SharedExporter<LogRecordData>>;

    fn metric_exporter(&self) -> anyhow::Result<SharedExporter<MetricData>>;
}

/// Per-kind customizers, applied to the network exporter in registration order.
#[derive(Default)]
pub struct Customizers {
    pub spans: Vec<ExporterCustomizer<SpanData>>,
    pub logs: Vec<ExporterCustomizer<LogRecordData>>,
    pub metrics: Vec<ExporterCustomizer<MetricData>>,
}

/// The placeholders wired into the pipelines.
#[derive(Clone)]
pub struct Delegates {
    pub spans: Arc<DelegatingExporter<SpanData>>,
    pub logs: Arc<DelegatingExporter<LogRecordData>>,
    pub metrics: Arc<DelegatingExporter<MetricData>>,
}

impl Delegates {
    pub fn new() -> Self {
        Self {
            spans: Arc::new(DelegatingExporter::new()),
            logs: Arc::new(DelegatingExporter::new()),
            metrics: Arc::new(DelegatingExporter::new()),
        }
    }
}

impl Default for Delegates {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOutcome {
    pub disk_buffering: bool,
    pub spans: ReplayReport,
    pub logs: ReplayReport,
    pub metrics: ReplayReport,
}

type NetworkExporters = (
    SharedExporter<SpanData>,
    SharedExporter<LogRecordData>,
    SharedExporter<MetricData>,
);

struct Stores {
    spans: Arc<DiskBufferStore>,
    logs: Arc<DiskBufferStore>,
    metrics: Arc<DiskBufferStore>,
}

pub struct ExporterInitializer {
    pub factory: Arc<dyn ExporterFactory>,
    pub customizers: Customizers,
    pub disk: DiskBufferingConfig,
    pub cache_storage: Arc<dyn CacheStorage>,
    pub clock: Arc<dyn Clock>,
    pub delegates: Delegates,
    pub scheduler: Arc<DiskDrainScheduler>,
}

impl ExporterInitializer {
    /// Build, persist-wrap and attach the exporters.
    ///
    /// A store that cannot be opened only turns disk buffering off; errors from
    /// the factory or from attaching are returned.
    pub async fn run(self) -> anyhow::Result<InitOutcome> {
        let (spans, logs, metrics) = self.build_network_exporters().await?;
        let spans = apply_customizers(spans, &self.customizers.spans);
        let logs = apply_customizers(logs, &self.customizers.logs);
        let metrics = apply_customizers(metrics, &self.customizers.metrics);

        let stores = if self.disk.enabled {
            self.open_stores().await
        } else {
            info!("disk buffering disabled by configuration");
            None
        };

        let disk_buffering = stores.is_some();
        let (spans, logs, metrics) = match stores {
            Some(stores) => {
                self.scheduler.register(vec![
                    Arc::new(DiskDrainReader::new(stores.spans.clone(), spans.clone()))
                        as Arc<dyn DrainSource>,
                    Arc::new(DiskDrainReader::new(stores.logs.clone(), logs.clone())),
                    Arc::new(DiskDrainReader::new(stores.metrics.clone(), metrics.clone())),
                ]);
                self.scheduler.enable();
                let spans: SharedExporter<SpanData> =
                    Arc::new(PersistingExporter::new(stores.spans, spans));
                let logs: SharedExporter<LogRecordData> =
                    Arc::new(PersistingExporter::new(stores.logs, logs));
                let metrics: SharedExporter<MetricData> =
                    Arc::new(PersistingExporter::new(stores.metrics, metrics));
                (spans, logs, metrics)
            }
            None => {
                self.scheduler.disable();
                self.scheduler.clear_readers();
                (spans, logs, metrics)
            }
        };

        let outcome = InitOutcome {
            disk_buffering,
            spans: self.delegates.spans.attach_delegate(spans).await?,
            logs: self.delegates.logs.attach_delegate(logs).await?,
            metrics: self.delegates.metrics.attach_delegate(metrics).await?,
        };
        info!(
            "exporters attached (disk buffering {}); replayed {} span, {} log, {} metric batches",
            if disk_buffering { "on" } else { "off" },
            outcome.spans.replayed,
            outcome.logs.replayed,
            outcome.metrics.replayed
        );
        Ok(outcome)
    }

    /// Factory constructors may block on I/O, so they run on the blocking pool
    /// and never on the runtime thread that built the agent.
    async fn build_network_exporters(&self) -> anyhow::Result<NetworkExporters> {
        let factory = self.factory.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<NetworkExporters> {
            Ok((
                factory.span_exporter().context("building span exporter")?,
                factory.log_exporter().context("building log exporter")?,
                factory.metric_exporter().context("building metric exporter")?,
            ))
        })
        .await
        .context("exporter factory panicked")?
    }

    /// All three stores or none.
    async fn open_stores(&self) -> Option<Stores> {
        let storage = self.disk.storage.clone();
        let cache = self.cache_storage.clone();
        let clock = self.clock.clone();

        let opened = tokio::task::spawn_blocking(move || -> Result<Stores, StorageError> {
            let open = |kind| {
                DiskBufferStore::open_with_clock(kind, &storage, cache.as_ref(), clock.clone())
                    .map(Arc::new)
            };
            Ok(Stores {
                spans: open(SignalKind::Trace)?,
                logs: open(SignalKind::Log)?,
                metrics: open(SignalKind::Metric)?,
            })
        })
        .await;

        match opened {
            Ok(Ok(stores)) => Some(stores),
            Ok(Err(e)) => {
                warn!("disk buffering unavailable, exporting directly: {}", e);
                None
            }
            Err(e) => {
                error!("opening disk buffers failed unexpectedly: {}", e);
                None
            }
        }
    }
}
