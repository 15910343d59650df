//! Exporter that writes each batch to the log as JSON.
//!
//! Used by the demo binary in place of a network exporter, and as the default
//! when the host does not supply an [`ExporterFactory`].

use super::{Exporter, SharedExporter};
use crate::error::ExportError;
use crate::initializer::ExporterFactory;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use telemetry_shared::{LogRecordData, MetricData, Signal, SpanData};
use tracing::info;

#[derive(Serialize)]
struct LoggedBatch<'a, T> {
    service: &'a str,
    host: &'a str,
    signal: &'static str,
    records: &'a [T],
}

pub struct LoggingExporter {
    service_name: String,
    host_name: String,
    exported: AtomicU64,
    shut_down: AtomicBool,
}

impl LoggingExporter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            host_name: crate::host_name(),
            exported: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Records written so far.
    pub fn exported(&self) -> u64 {
        self.exported.load(Ordering::Relaxed)
    }

    fn log_batch<T: Signal>(&self, batch: &[T]) -> Result<(), ExportError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ExportError::Shutdown);
        }
        let line = serde_json::to_string(&LoggedBatch {
            service: &self.service_name,
            host: &self.host_name,
            signal: T::KIND.as_str(),
            records: batch,
        })
        .map_err(|e| ExportError::Failed(e.to_string()))?;
        self.exported.fetch_add(batch.len() as u64, Ordering::Relaxed);
        info!(target: "telemetry_agent::export", "{}", line);
        Ok(())
    }
}

#[async_trait]
impl<T: Signal> Exporter<T> for LoggingExporter {
    async fn export(&self, batch: Vec<T>) -> Result<(), ExportError> {
        self.log_batch(&batch)
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        self.shut_down.store(true, Ordering::Release);
        Ok(())
    }
}

/// Builds one [`LoggingExporter`] per signal kind.
#[derive(Debug, Clone)]
pub struct LoggingExporterFactory {
    service_name: String,
}

impl LoggingExporterFactory {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

impl ExporterFactory for LoggingExporterFactory {
    fn span_exporter(&self) -> anyhow::Result<SharedExporter<SpanData>> {
        Ok(Arc::new(LoggingExporter::new(&self.service_name)))
    }

    fn log_exporter(&self) -> anyhow::Result<SharedExporter<LogRecordData>> {
        Ok(Arc::new(LoggingExporter::new(&self.service_name)))
    }

    fn metric_exporter(&self) -> anyhow::Result<SharedExporter<MetricData>> {
        Ok(Arc::new(LoggingExporter::new(&self.service_name)))
    }
}
