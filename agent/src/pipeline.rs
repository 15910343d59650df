//! Minimal signal pipeline: records are grouped into batches and handed to an
//! exporter by a worker task, one batch at a time, in emission order.
//!
//! Sampling and enrichment belong to the host; the agent only needs somewhere
//! to wire the [`DelegatingExporter`](crate::export::DelegatingExporter) and a
//! `force_flush` for the crash path.

use crate::error::ExportError;
use crate::export::SharedExporter;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use telemetry_shared::Signal;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// A pipeline that can be asked to deliver everything it holds.
#[async_trait]
pub trait ForceFlush: Send + Sync {
    fn name(&self) -> &str;

    async fn force_flush(&self) -> Result<(), ExportError>;
}

enum Command<T> {
    Export(Vec<T>),
    Flush(oneshot::Sender<Result<(), ExportError>>),
    Shutdown(oneshot::Sender<Result<(), ExportError>>),
}

pub struct SignalPipeline<T: Signal> {
    pending: Mutex<Vec<T>>,
    max_batch_size: usize,
    commands: mpsc::UnboundedSender<Command<T>>,
    shut_down: AtomicBool,
}

impl<T: Signal> SignalPipeline<T> {
    /// Spawn the export worker on `handle`.
    pub fn new(exporter: SharedExporter<T>, max_batch_size: usize, handle: &Handle) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        handle.spawn(run_worker(exporter, rx));
        Self {
            pending: Mutex::new(Vec::with_capacity(max_batch_size)),
            max_batch_size: max_batch_size.max(1),
            commands,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Queue one record. A full batch is handed to the worker immediately.
    pub fn emit(&self, record: T) {
        if self.shut_down.load(Ordering::Acquire) {
            debug!("{} pipeline shut down, dropping record", T::KIND);
            return;
        }
        let mut pending = self.lock_pending();
        pending.push(record);
        if pending.len() >= self.max_batch_size {
            // Sent under the lock so batches reach the worker in emission order.
            let batch = std::mem::take(&mut *pending);
            if self.commands.send(Command::Export(batch)).is_err() {
                warn!("{} pipeline worker gone, batch dropped", T::KIND);
            }
        }
    }

    /// Records not yet handed to the worker.
    pub fn pending_records(&self) -> usize {
        self.lock_pending().len()
    }

    /// Hand over the partial batch, then wait until the exporter has taken
    /// every queued batch and flushed.
    pub async fn force_flush(&self) -> Result<(), ExportError> {
        let (ack, done) = oneshot::channel();
        self.submit_pending_then(Command::Flush(ack))?;
        done.await.map_err(|_| ExportError::Shutdown)?
    }

    /// Flush what is queued and shut the exporter down. Later records are dropped.
    pub async fn shutdown(&self) -> Result<(), ExportError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (ack, done) = oneshot::channel();
        self.submit_pending_then(Command::Shutdown(ack))?;
        done.await.map_err(|_| ExportError::Shutdown)?
    }

    fn submit_pending_then(&self, command: Command<T>) -> Result<(), ExportError> {
        let mut pending = self.lock_pending();
        if !pending.is_empty() {
            let batch = std::mem::take(&mut *pending);
            self.commands
                .send(Command::Export(batch))
                .map_err(|_| ExportError::Shutdown)?;
        }
        self.commands.send(command).map_err(|_| ExportError::Shutdown)
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<T>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<T: Signal> ForceFlush for SignalPipeline<T> {
    fn name(&self) -> &str {
        T::KIND.as_str()
    }

    async fn force_flush(&self) -> Result<(), ExportError> {
        SignalPipeline::force_flush(self).await
    }
}

async fn run_worker<T: Signal>(
    exporter: SharedExporter<T>,
    mut commands: mpsc::UnboundedReceiver<Command<T>>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Export(batch) => {
                let records = batch.len();
                if let Err(e) = exporter.export(batch).await {
                    warn!("{} export of {} records failed: {}", T::KIND, records, e);
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(exporter.flush().await);
            }
            Command::Shutdown(ack) => {
                let _ = ack.send(exporter.shutdown().await);
                break;
            }
        }
    }
    debug!("{} pipeline worker stopped", T::KIND);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::Exporter;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use telemetry_shared::SpanData;

    #[derive(Default)]
    struct Recording {
        batches: Mutex<Vec<Vec<String>>>,
        flushes: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl Exporter<SpanData> for Recording {
        async fn export(&self, batch: Vec<SpanData>) -> Result<(), ExportError> {
            let names = batch.into_iter().map(|s| s.name).collect();
            self.batches.lock().unwrap().push(names);
            Ok(())
        }

        async fn flush(&self) -> Result<(), ExportError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), ExportError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn span(name: &str) -> SpanData {
        SpanData::new(name, "4bf92f3577b34da6a3ce929d0e0e4736", "00f067aa0ba902b7")
    }

    #[tokio::test]
    async fn test_full_batches_exported_and_flush_sends_remainder() {
        let exporter = Arc::new(Recording::default());
        let pipeline = SignalPipeline::<SpanData>::new(exporter.clone(), 2, &Handle::current());

        for name in ["a", "b", "c"] {
            pipeline.emit(span(name));
        }
        assert_eq!(pipeline.pending_records(), 1);

        pipeline.force_flush().await.unwrap();
        assert_eq!(pipeline.pending_records(), 0);
        assert_eq!(
            *exporter.batches.lock().unwrap(),
            vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
        );
        assert_eq!(exporter.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(ForceFlush::name(&pipeline), "trace");
    }

    #[tokio::test]
    async fn test_shutdown_drops_later_records() {
        let exporter = Arc::new(Recording::default());
        let pipeline = SignalPipeline::<SpanData>::new(exporter.clone(), 10, &Handle::current());

        pipeline.emit(span("before"));
        pipeline.shutdown().await.unwrap();
        pipeline.shutdown().await.unwrap();
        pipeline.emit(span("after"));

        assert_eq!(*exporter.batches.lock().unwrap(), vec![vec!["before".to_string()]]);
        assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.pending_records(), 0);
        assert!(matches!(pipeline.force_flush().await, Err(ExportError::Shutdown)));
    }
}
