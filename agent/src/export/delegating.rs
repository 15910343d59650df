//! Placeholder exporter installed into a pipeline before the real exporter exists.
//!
//! Every batch exported before [`DelegatingExporter::attach_delegate`] is queued in
//! memory. Attaching swaps in the real exporter and replays the queue in
//! submission order while holding the state lock, so a concurrent `export` can
//! never overtake the replay. After the replay the delegate is published through
//! a `OnceLock` and later calls skip the lock entirely.

use super::{Exporter, SharedExporter};
use crate::error::ExportError;
use crate::metrics;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::OnceLock;
use telemetry_shared::Signal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Backlog size at which a still-unattached exporter starts warning; repeated
/// at every doubling after that.
pub const BACKLOG_WARN_BATCHES: usize = 256;

fn backlog_warning_due(pending: usize) -> bool {
    pending >= BACKLOG_WARN_BATCHES && pending.is_power_of_two()
}

/// Outcome of replaying buffered batches into a freshly attached delegate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
}

struct BufferState<T> {
    delegate: Option<SharedExporter<T>>,
    pending: VecDeque<Vec<T>>,
}

pub struct DelegatingExporter<T: Signal> {
    /// Set only after the replay completed; read without locking.
    attached: OnceLock<SharedExporter<T>>,
    state: Mutex<BufferState<T>>,
}

impl<T: Signal> DelegatingExporter<T> {
    pub fn new() -> Self {
        Self {
            attached: OnceLock::new(),
            state: Mutex::new(BufferState {
                delegate: None,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.get().is_some()
    }

    /// Number of batches waiting for a delegate.
    pub async fn pending_batches(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Attach the real exporter and replay everything buffered so far.
    ///
    /// May be called once; a second call returns [`ExportError::AlreadyAttached`]
    /// and leaves the first delegate in place. Replay failures are logged and
    /// counted, never re-queued.
    pub async fn attach_delegate(&self, real: SharedExporter<T>) -> Result<ReplayReport, ExportError> {
        let kind = T::KIND.as_str();
        let mut state = self.state.lock().await;
        if state.delegate.is_some() {
            warn!("{} exporter already has a delegate; ignoring second attach", kind);
            return Err(ExportError::AlreadyAttached);
        }
        state.delegate = Some(real.clone());

        let pending = std::mem::take(&mut state.pending);
        let mut report = ReplayReport::default();
        for batch in pending {
            match real.export(batch).await {
                Ok(()) => {
                    report.replayed += 1;
                    metrics::REPLAYED_BATCHES.with_label_values(&[kind, "ok"]).inc();
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::REPLAYED_BATCHES.with_label_values(&[kind, "error"]).inc();
                    warn!("replay of buffered {} batch failed: {}", kind, e);
                }
            }
        }

        // Cannot already be set: we are the only writer and hold the lock.
        let _ = self.attached.set(real);
        metrics::PENDING_BATCHES.with_label_values(&[kind]).set(0.0);
        drop(state);

        info!(
            "{} delegate attached: {} buffered batches replayed, {} failed",
            kind, report.replayed, report.failed
        );
        Ok(report)
    }

    /// Delegate visible under the lock; `Some` only once the replay finished.
    async fn settled_delegate(&self) -> Option<SharedExporter<T>> {
        if let Some(delegate) = self.attached.get() {
            return Some(delegate.clone());
        }
        self.state.lock().await.delegate.clone()
    }
}

impl<T: Signal> Default for DelegatingExporter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Signal> Exporter<T> for DelegatingExporter<T> {
    async fn export(&self, batch: Vec<T>) -> Result<(), ExportError> {
        if let Some(delegate) = self.attached.get() {
            return delegate.export(batch).await;
        }

        let mut state = self.state.lock().await;
        if let Some(delegate) = state.delegate.clone() {
            // Attach finished while we waited for the lock.
            drop(state);
            return delegate.export(batch).await;
        }

        state.pending.push_back(batch);
        let pending = state.pending.len();
        metrics::PENDING_BATCHES
            .with_label_values(&[T::KIND.as_str()])
            .set(pending as f64);
        if backlog_warning_due(pending) {
            warn!(
                "{} exporter still not attached; {} batches held in memory",
                T::KIND, pending
            );
        } else {
            debug!("{} batch buffered until exporter is ready ({} pending)", T::KIND, pending);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), ExportError> {
        match self.settled_delegate().await {
            Some(delegate) => delegate.flush().await,
            None => Ok(()),
        }
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        match self.settled_delegate().await {
            Some(delegate) => delegate.shutdown().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use telemetry_shared::{LogRecordData, Severity};

    #[derive(Default)]
    struct MockExporter {
        batches: StdMutex<Vec<Vec<String>>>,
        flushes: AtomicUsize,
        fail_bodies: Vec<&'static str>,
        delay: Option<Duration>,
    }

    impl MockExporter {
        fn bodies(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Exporter<LogRecordData> for MockExporter {
        async fn export(&self, batch: Vec<LogRecordData>) -> Result<(), ExportError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let bodies: Vec<String> = batch.into_iter().map(|r| r.body).collect();
            let failed = bodies.iter().any(|b| self.fail_bodies.contains(&b.as_str()));
            self.batches.lock().unwrap().push(bodies);
            if failed {
                return Err(ExportError::Failed("collector rejected batch".to_string()));
            }
            Ok(())
        }

        async fn flush(&self) -> Result<(), ExportError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn batch(body: &str) -> Vec<LogRecordData> {
        vec![LogRecordData::new(Severity::Info, body)]
    }

    #[tokio::test]
    async fn test_buffered_batches_replay_in_order_then_forward() {
        let exporter = DelegatingExporter::<LogRecordData>::new();
        exporter.export(batch("a")).await.unwrap();
        exporter.export(batch("b")).await.unwrap();
        assert_eq!(exporter.pending_batches().await, 2);

        let mock = Arc::new(MockExporter::default());
        let report = exporter.attach_delegate(mock.clone()).await.unwrap();
        assert_eq!(report, ReplayReport { replayed: 2, failed: 0 });
        assert_eq!(mock.bodies(), vec![vec!["a".to_string()], vec!["b".to_string()]]);

        exporter.export(batch("c")).await.unwrap();
        assert_eq!(mock.bodies().len(), 3);
        assert_eq!(mock.bodies()[2], vec!["c".to_string()]);
        assert_eq!(exporter.pending_batches().await, 0);
    }

    #[test]
    fn test_backlog_warning_at_threshold_and_doublings() {
        assert!(!backlog_warning_due(1));
        assert!(!backlog_warning_due(BACKLOG_WARN_BATCHES - 1));
        assert!(backlog_warning_due(BACKLOG_WARN_BATCHES));
        assert!(!backlog_warning_due(BACKLOG_WARN_BATCHES + 1));
        assert!(backlog_warning_due(BACKLOG_WARN_BATCHES * 4));
    }

    #[tokio::test]
    async fn test_unattached_backlog_keeps_every_batch() {
        let exporter = DelegatingExporter::<LogRecordData>::new();
        for i in 0..BACKLOG_WARN_BATCHES + 1 {
            exporter
                .export(vec![LogRecordData::new(Severity::Info, format!("line {}", i))])
                .await
                .unwrap();
        }
        assert_eq!(exporter.pending_batches().await, BACKLOG_WARN_BATCHES + 1);
        assert!(!exporter.is_attached());
    }

    #[tokio::test]
    async fn test_second_attach_rejected() {
        let exporter = DelegatingExporter::<LogRecordData>::new();
        let first = Arc::new(MockExporter::default());
        let second = Arc::new(MockExporter::default());
        exporter.attach_delegate(first.clone()).await.unwrap();
        assert!(matches!(
            exporter.attach_delegate(second.clone()).await,
            Err(ExportError::AlreadyAttached)
        ));

        exporter.export(batch("x")).await.unwrap();
        assert_eq!(first.bodies().len(), 1);
        assert!(second.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_replay_failure_is_reported_not_requeued() {
        let exporter = DelegatingExporter::<LogRecordData>::new();
        exporter.export(batch("ok-1")).await.unwrap();
        exporter.export(batch("bad")).await.unwrap();
        exporter.export(batch("ok-2")).await.unwrap();

        let mock = Arc::new(MockExporter {
            fail_bodies: vec!["bad"],
            ..MockExporter::default()
        });
        let report = exporter.attach_delegate(mock.clone()).await.unwrap();
        assert_eq!(report, ReplayReport { replayed: 2, failed: 1 });
        assert_eq!(mock.bodies().len(), 3);
        assert_eq!(exporter.pending_batches().await, 0);
    }

    #[tokio::test]
    async fn test_flush_is_noop_until_attached() {
        let exporter = DelegatingExporter::<LogRecordData>::new();
        exporter.flush().await.unwrap();
        exporter.shutdown().await.unwrap();

        let mock = Arc::new(MockExporter::default());
        exporter.attach_delegate(mock.clone()).await.unwrap();
        exporter.flush().await.unwrap();
        assert_eq!(mock.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_exports_never_overtake_replay() {
        let exporter = Arc::new(DelegatingExporter::<LogRecordData>::new());
        for i in 0..20 {
            exporter.export(batch(&format!("early-{}", i))).await.unwrap();
        }

        let mock = Arc::new(MockExporter {
            delay: Some(Duration::from_millis(2)),
            ..MockExporter::default()
        });
        let attach = {
            let exporter = exporter.clone();
            let mock = mock.clone();
            tokio::spawn(async move { exporter.attach_delegate(mock).await })
        };

        let mut late = Vec::new();
        for i in 0..10 {
            let exporter = exporter.clone();
            late.push(tokio::spawn(async move {
                exporter.export(batch(&format!("late-{}", i))).await
            }));
        }
        attach.await.unwrap().unwrap();
        for handle in late {
            handle.await.unwrap().unwrap();
        }

        let bodies: Vec<String> = mock.bodies().into_iter().flatten().collect();
        assert_eq!(bodies.len(), 30);
        // Late batches were either queued behind the early ones or forwarded after
        // the replay; either way every early batch is delivered first, once, in order.
        let expected: Vec<String> = (0..20).map(|i| format!("early-{}", i)).collect();
        assert_eq!(bodies[..20], expected[..]);
        assert!(bodies[20..].iter().all(|b| b.starts_with("late-")));
    }
}
