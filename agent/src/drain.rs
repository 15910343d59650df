//! Draining persisted batches back to the network.
//!
//! [`DiskDrainScheduler`] is the single registry of drain readers, one per
//! signal kind, and owns the `Disabled`/`Enabled` switch. Enabling arms the
//! periodic trigger; disabling cancels it and also stops a drain that is already
//! running, which checks the switch between batches.

use crate::error::ExportError;
use crate::export::SharedExporter;
use crate::metrics;
use crate::periodic::{BoxedRun, PeriodicTask, PeriodicWork};
use crate::storage::DiskBufferStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use telemetry_shared::protocol::wire::decode_batch;
use telemetry_shared::{Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of moving one persisted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Delivered and removed from disk
    Exported,
    /// Undecodable, removed from disk
    Discarded,
    /// Nothing readable right now
    Empty,
}

#[async_trait]
pub trait DrainSource: Send + Sync {
    fn kind(&self) -> SignalKind;

    async fn export_one(&self) -> Result<DrainOutcome, ExportError>;
}

/// Reads one kind's store and sends batches to the undecorated network exporter.
pub struct DiskDrainReader<T: Signal> {
    store: Arc<DiskBufferStore>,
    network: SharedExporter<T>,
}

impl<T: Signal> DiskDrainReader<T> {
    pub fn new(store: Arc<DiskBufferStore>, network: SharedExporter<T>) -> Self {
        Self { store, network }
    }
}

#[async_trait]
impl<T: Signal> DrainSource for DiskDrainReader<T> {
    fn kind(&self) -> SignalKind {
        T::KIND
    }

    async fn export_one(&self) -> Result<DrainOutcome, ExportError> {
        let kind = T::KIND.as_str();
        let store = self.store.clone();
        let frame = match tokio::task::spawn_blocking(move || store.read_next())
            .await
            .map_err(|e| ExportError::Task(e.to_string()))??
        {
            Some(frame) => frame,
            None => return Ok(DrainOutcome::Empty),
        };

        let outcome = match decode_batch::<T>(&frame.payload) {
            Ok(batch) => {
                let records = batch.len();
                if let Err(e) = self.network.export(batch).await {
                    // Stays on disk until the next cycle or until it ages out.
                    metrics::DRAINED_BATCHES.with_label_values(&[kind, "error"]).inc();
                    return Err(e);
                }
                metrics::DRAINED_BATCHES.with_label_values(&[kind, "ok"]).inc();
                debug!("drained {} {} records from disk", records, kind);
                DrainOutcome::Exported
            }
            Err(e) => {
                metrics::DRAINED_BATCHES.with_label_values(&[kind, "corrupt"]).inc();
                warn!("discarding undecodable {} batch from {}: {}", kind, frame.path.display(), e);
                DrainOutcome::Discarded
            }
        };

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.acknowledge(&frame))
            .await
            .map_err(|e| ExportError::Task(e.to_string()))??;
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Disabled,
    Enabled,
}

/// Totals for one `drain_once` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub exported: usize,
    pub discarded: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct DiskDrainScheduler {
    enabled: AtomicBool,
    readers: Mutex<Vec<Arc<dyn DrainSource>>>,
    /// Held across enable/disable so the switch and the schedule move together.
    schedule: Mutex<Option<CancellationToken>>,
    periodic: Arc<dyn PeriodicWork>,
    interval: Duration,
    max_batches_per_drain: usize,
}

impl DiskDrainScheduler {
    pub fn new(
        periodic: Arc<dyn PeriodicWork>,
        interval: Duration,
        max_batches_per_drain: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(false),
            readers: Mutex::new(Vec::new()),
            schedule: Mutex::new(None),
            periodic,
            interval,
            max_batches_per_drain,
        })
    }

    pub fn state(&self) -> ScheduleState {
        if self.enabled.load(Ordering::Acquire) {
            ScheduleState::Enabled
        } else {
            ScheduleState::Disabled
        }
    }

    /// Replace the registered readers.
    pub fn register(&self, readers: Vec<Arc<dyn DrainSource>>) {
        let kinds: Vec<_> = readers.iter().map(|r| r.kind().as_str()).collect();
        debug!("drain readers registered: {:?}", kinds);
        *lock_recover(&self.readers) = readers;
    }

    pub fn clear_readers(&self) {
        lock_recover(&self.readers).clear();
    }

    pub fn reader_count(&self) -> usize {
        lock_recover(&self.readers).len()
    }

    /// `Disabled -> Enabled`, arming the periodic drain. No-op when enabled.
    pub fn enable(self: &Arc<Self>) {
        let mut schedule = lock_recover(&self.schedule);
        if self.enabled.load(Ordering::Acquire) {
            return;
        }
        self.enabled.store(true, Ordering::Release);

        let weak = Arc::downgrade(self);
        let task: PeriodicTask = Arc::new(move || {
            let weak = weak.clone();
            let run: BoxedRun = Box::pin(async move {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.drain_once().await;
                }
            });
            run
        });
        *schedule = Some(self.periodic.schedule(self.interval, task));
        info!("disk drain enabled (every {:?})", self.interval);
    }

    /// `Enabled -> Disabled`. Cancels the schedule and any drain in progress.
    pub fn disable(&self) {
        let mut schedule = lock_recover(&self.schedule);
        let was_enabled = self.enabled.swap(false, Ordering::AcqRel);
        if let Some(token) = schedule.take() {
            token.cancel();
        }
        if was_enabled {
            info!("disk drain disabled");
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// One drain pass over every registered kind. Each kind stops at its first
    /// delivery failure, when its store runs dry, or after
    /// `max_batches_per_drain` batches.
    pub async fn drain_once(&self) -> DrainSummary {
        let mut summary = DrainSummary::default();
        if !self.is_enabled() {
            return summary;
        }
        let readers = lock_recover(&self.readers).clone();

        for reader in readers {
            for _ in 0..self.max_batches_per_drain {
                if !self.is_enabled() {
                    summary.cancelled = true;
                    debug!("drain cancelled mid-pass");
                    return summary;
                }
                match reader.export_one().await {
                    Ok(DrainOutcome::Exported) => summary.exported += 1,
                    Ok(DrainOutcome::Discarded) => summary.discarded += 1,
                    Ok(DrainOutcome::Empty) => break,
                    Err(e) => {
                        summary.failed += 1;
                        warn!("draining {} batches failed: {}", reader.kind(), e);
                        break;
                    }
                }
            }
        }

        if summary.exported + summary.discarded + summary.failed > 0 {
            info!(
                "drain pass: {} exported, {} discarded, {} failed",
                summary.exported, summary.discarded, summary.failed
            );
        }
        summary
    }
}

impl Drop for DiskDrainScheduler {
    fn drop(&mut self) {
        if let Ok(mut schedule) = self.schedule.lock() {
            if let Some(token) = schedule.take() {
                token.cancel();
            }
        }
    }
}

/// The guarded data stays consistent across a panic, so poisoning is ignored.
fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Counts `schedule` calls and never runs anything on its own.
    #[derive(Default)]
    struct ManualPeriodicWork {
        scheduled: AtomicUsize,
        tokens: Mutex<Vec<CancellationToken>>,
    }

    impl PeriodicWork for ManualPeriodicWork {
        fn schedule(&self, _interval: Duration, _task: PeriodicTask) -> CancellationToken {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
            let token = CancellationToken::new();
            self.tokens.lock().unwrap().push(token.clone());
            token
        }
    }

    struct ScriptedSource {
        kind: SignalKind,
        script: Mutex<VecDeque<Result<DrainOutcome, ExportError>>>,
        calls: AtomicUsize,
        on_call: Option<Box<dyn Fn() + Send + Sync>>,
    }

    impl ScriptedSource {
        fn new(kind: SignalKind, script: Vec<Result<DrainOutcome, ExportError>>) -> Self {
            Self {
                kind,
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                on_call: None,
            }
        }

        fn endless(kind: SignalKind) -> Self {
            Self::new(kind, Vec::new())
        }
    }

    #[async_trait]
    impl DrainSource for ScriptedSource {
        fn kind(&self) -> SignalKind {
            self.kind
        }

        async fn export_one(&self) -> Result<DrainOutcome, ExportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = &self.on_call {
                hook();
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(DrainOutcome::Exported))
        }
    }

    fn scheduler(max: usize) -> (Arc<DiskDrainScheduler>, Arc<ManualPeriodicWork>) {
        let periodic = Arc::new(ManualPeriodicWork::default());
        let scheduler = DiskDrainScheduler::new(periodic.clone(), Duration::from_secs(10), max);
        (scheduler, periodic)
    }

    #[tokio::test]
    async fn test_starts_disabled_and_drains_nothing() {
        let (scheduler, periodic) = scheduler(10);
        let source = Arc::new(ScriptedSource::endless(SignalKind::Trace));
        scheduler.register(vec![source.clone() as Arc<dyn DrainSource>]);

        assert_eq!(scheduler.state(), ScheduleState::Disabled);
        assert_eq!(scheduler.drain_once().await, DrainSummary::default());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(periodic.scheduled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_enable_is_idempotent() {
        let (scheduler, periodic) = scheduler(10);
        scheduler.enable();
        scheduler.enable();
        assert_eq!(scheduler.state(), ScheduleState::Enabled);
        assert_eq!(periodic.scheduled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disable_is_idempotent_and_cancels_schedule() {
        let (scheduler, periodic) = scheduler(10);
        scheduler.enable();
        scheduler.disable();
        scheduler.disable();
        assert_eq!(scheduler.state(), ScheduleState::Disabled);
        assert!(periodic.tokens.lock().unwrap()[0].is_cancelled());

        // Re-enabling arms a fresh schedule.
        scheduler.enable();
        assert_eq!(periodic.scheduled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pass_is_bounded_per_kind() {
        let (scheduler, _) = scheduler(5);
        let spans = Arc::new(ScriptedSource::endless(SignalKind::Trace));
        let logs = Arc::new(ScriptedSource::endless(SignalKind::Log));
        scheduler.register(vec![spans.clone() as Arc<dyn DrainSource>, logs.clone()]);
        scheduler.enable();

        let summary = scheduler.drain_once().await;
        assert_eq!(summary.exported, 10);
        assert_eq!(spans.calls.load(Ordering::SeqCst), 5);
        assert_eq!(logs.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failure_stops_only_that_kind() {
        let (scheduler, _) = scheduler(10);
        let spans = Arc::new(ScriptedSource::new(
            SignalKind::Trace,
            vec![
                Ok(DrainOutcome::Exported),
                Err(ExportError::Failed("collector down".to_string())),
            ],
        ));
        let metrics = Arc::new(ScriptedSource::new(
            SignalKind::Metric,
            vec![
                Ok(DrainOutcome::Discarded),
                Ok(DrainOutcome::Exported),
                Ok(DrainOutcome::Empty),
            ],
        ));
        scheduler.register(vec![spans.clone() as Arc<dyn DrainSource>, metrics.clone()]);
        scheduler.enable();

        let summary = scheduler.drain_once().await;
        assert_eq!(
            summary,
            DrainSummary {
                exported: 2,
                discarded: 1,
                failed: 1,
                cancelled: false
            }
        );
        assert_eq!(spans.calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disable_during_pass_stops_further_sends() {
        let (scheduler, _) = scheduler(100);
        let weak = Arc::downgrade(&scheduler);
        let mut source = ScriptedSource::endless(SignalKind::Log);
        let calls_at_disable = Arc::new(AtomicUsize::new(0));
        {
            let calls_at_disable = calls_at_disable.clone();
            source.on_call = Some(Box::new(move || {
                // Disable from "another thread" on the third batch.
                if calls_at_disable.fetch_add(1, Ordering::SeqCst) == 2 {
                    if let Some(s) = weak.upgrade() {
                        s.disable();
                    }
                }
            }));
        }
        let source = Arc::new(source);
        scheduler.register(vec![source.clone() as Arc<dyn DrainSource>]);
        scheduler.enable();

        let summary = scheduler.drain_once().await;
        assert!(summary.cancelled);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.state(), ScheduleState::Disabled);

        assert_eq!(scheduler.drain_once().await, DrainSummary::default());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_clear_readers() {
        let (scheduler, _) = scheduler(10);
        scheduler.register(vec![Arc::new(ScriptedSource::endless(SignalKind::Trace)) as Arc<dyn DrainSource>]);
        assert_eq!(scheduler.reader_count(), 1);
        scheduler.clear_readers();
        assert_eq!(scheduler.reader_count(), 0);
    }
}
