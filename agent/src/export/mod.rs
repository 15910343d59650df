//! Exporter seam.
//!
//! Everything that receives signal batches implements [`Exporter`]: the
//! host-supplied network exporters, the [`DelegatingExporter`] placeholder wired
//! into each pipeline at startup, and the [`PersistingExporter`] decorator that
//! routes batches through the disk buffer.

pub mod delegating;
pub mod logging;
pub mod persisting;

pub use delegating::{DelegatingExporter, ReplayReport};
pub use logging::{LoggingExporter, LoggingExporterFactory};
pub use persisting::PersistingExporter;

use crate::error::ExportError;
use async_trait::async_trait;
use std::sync::Arc;

/// A sink for ordered batches of one signal type.
#[async_trait]
pub trait Exporter<T: Send + 'static>: Send + Sync {
    /// Deliver one batch. Record order inside the batch is preserved.
    async fn export(&self, batch: Vec<T>) -> Result<(), ExportError>;

    async fn flush(&self) -> Result<(), ExportError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        Ok(())
    }
}

pub type SharedExporter<T> = Arc<dyn Exporter<T>>;

/// A pure transform wrapping an exporter, e.g. to add a filter or a counter.
pub type ExporterCustomizer<T> = Box<dyn Fn(SharedExporter<T>) -> SharedExporter<T> + Send + Sync>;

/// Apply customizers in registration order; each wraps the previous result.
pub fn apply_customizers<T: Send + 'static>(
    base: SharedExporter<T>,
    customizers: &[ExporterCustomizer<T>],
) -> SharedExporter<T> {
    customizers
        .iter()
        .fold(base, |exporter, customize| customize(exporter))
}
