//! Exporter decorator writing batches to the disk buffer instead of the network.
//!
//! Batches reach the collector later through the drain. If the append fails the
//! batch goes straight to the network exporter so a storage hiccup never loses it.

use super::{Exporter, SharedExporter};
use crate::error::ExportError;
use crate::storage::DiskBufferStore;
use async_trait::async_trait;
use std::sync::Arc;
use telemetry_shared::protocol::wire::encode_batch;
use telemetry_shared::Signal;
use tracing::warn;

pub struct PersistingExporter<T: Signal> {
    store: Arc<DiskBufferStore>,
    network: SharedExporter<T>,
}

impl<T: Signal> PersistingExporter<T> {
    pub fn new(store: Arc<DiskBufferStore>, network: SharedExporter<T>) -> Self {
        Self { store, network }
    }

    async fn persist(&self, batch: &[T]) -> Result<(), ExportError> {
        let payload = encode_batch(batch)?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.append(&payload))
            .await
            .map_err(|e| ExportError::Task(e.to_string()))??;
        Ok(())
    }
}

#[async_trait]
impl<T: Signal> Exporter<T> for PersistingExporter<T> {
    async fn export(&self, batch: Vec<T>) -> Result<(), ExportError> {
        match self.persist(&batch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "persisting {} batch failed, exporting directly: {}",
                    T::KIND,
                    e
                );
                self.network.export(batch).await
            }
        }
    }

    async fn flush(&self) -> Result<(), ExportError> {
        self.network.flush().await
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        self.network.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::{DirectoryCacheStorage, ManualClock};
    use std::sync::Mutex;
    use telemetry_shared::protocol::wire::decode_batch;
    use telemetry_shared::{MetricData, SignalKind};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Network {
        batches: Mutex<Vec<Vec<MetricData>>>,
    }

    #[async_trait]
    impl Exporter<MetricData> for Network {
        async fn export(&self, batch: Vec<MetricData>) -> Result<(), ExportError> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn config(root: &std::path::Path) -> StorageConfig {
        StorageConfig {
            root_dir: Some(root.to_path_buf()),
            max_file_age_for_write_ms: 1_000,
            min_file_age_for_read_ms: 2_000,
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_batches_go_to_disk_not_network() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = DirectoryCacheStorage::new(tmp.path());
        let store = Arc::new(
            DiskBufferStore::open_with_clock(SignalKind::Metric, &config(tmp.path()), &cache, clock.clone())
                .unwrap(),
        );
        let network = Arc::new(Network::default());
        let exporter = PersistingExporter::<MetricData>::new(store.clone(), network.clone());

        let batch = vec![MetricData::gauge("cpu", 0.25), MetricData::counter("requests", 7.0)];
        exporter.export(batch.clone()).await.unwrap();

        assert!(network.batches.lock().unwrap().is_empty());
        clock.advance(5_000);
        let frame = store.read_next().unwrap().unwrap();
        let decoded: Vec<MetricData> = decode_batch(&frame.payload).unwrap();
        assert_eq!(decoded, batch);
    }

    #[tokio::test]
    async fn test_append_failure_falls_back_to_network() {
        let tmp = TempDir::new().unwrap();
        let cache = DirectoryCacheStorage::new(tmp.path());
        let store = Arc::new(DiskBufferStore::open(SignalKind::Metric, &config(tmp.path()), &cache).unwrap());
        let network = Arc::new(Network::default());
        let exporter = PersistingExporter::<MetricData>::new(store.clone(), network.clone());

        // Pull the directory out from under the store.
        std::fs::remove_dir_all(store.dir()).unwrap();

        exporter
            .export(vec![MetricData::gauge("memory", 512.0)])
            .await
            .unwrap();
        let sent = network.batches.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0].name, "memory");
    }
}
