//! Crash-time flush.
//!
//! [`CrashFlushCoordinator::install`] chains a panic hook in front of whatever
//! hook was installed before. On a panic the previous hook runs first, then
//! every pipeline is force-flushed on its own thread while the panicking thread
//! waits at most `flush_timeout` per pipeline. Failures are logged and never
//! stop the remaining flushes.

use crate::error::ExportError;
use crate::metrics;
use crate::pipeline::ForceFlush;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of one crash flush across all pipelines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrashFlushReport {
    pub flushed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

#[derive(Debug)]
enum FlushStatus {
    Flushed,
    Failed(String),
    TimedOut,
}

pub struct CrashFlushCoordinator {
    pipelines: Vec<Arc<dyn ForceFlush>>,
    flush_timeout: Duration,
    /// Set while a crash flush runs; a panic raised by a flush itself is not
    /// flushed again.
    flushing: AtomicBool,
}

impl CrashFlushCoordinator {
    pub fn new(pipelines: Vec<Arc<dyn ForceFlush>>, flush_timeout: Duration) -> Self {
        Self {
            pipelines,
            flush_timeout,
            flushing: AtomicBool::new(false),
        }
    }

    /// Install the process-wide hook. The hook in place at this moment keeps
    /// running, ahead of the flush.
    ///
    /// The hook fires for every panic, including ones later caught by tokio or
    /// `catch_unwind`; each of those also pays for a full flush on the
    /// panicking thread.
    pub fn install(self) -> Arc<Self> {
        let coordinator = Arc::new(self);
        let previous = panic::take_hook();
        let hook = coordinator.clone();
        panic::set_hook(Box::new(move |info| {
            previous(info);
            hook.on_panic(&info.to_string());
        }));
        info!(
            "crash flush installed for {} pipelines (timeout {:?})",
            coordinator.pipelines.len(),
            coordinator.flush_timeout
        );
        coordinator
    }

    fn on_panic(&self, description: &str) {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("uncaught panic, flushing telemetry: {}", description);
        let report = self.flush_all();
        info!(
            "crash flush finished: {} flushed, {} failed, {} timed out",
            report.flushed, report.failed, report.timed_out
        );
        self.flushing.store(false, Ordering::Release);
    }

    /// Force-flush every pipeline in order, each bounded by `flush_timeout`.
    pub fn flush_all(&self) -> CrashFlushReport {
        let mut report = CrashFlushReport::default();
        for pipeline in &self.pipelines {
            let name = pipeline.name().to_string();
            match flush_with_timeout(pipeline.clone(), self.flush_timeout) {
                FlushStatus::Flushed => {
                    report.flushed += 1;
                    metrics::CRASH_FLUSHES.with_label_values(&[name.as_str(), "ok"]).inc();
                }
                FlushStatus::Failed(reason) => {
                    report.failed += 1;
                    metrics::CRASH_FLUSHES.with_label_values(&[name.as_str(), "error"]).inc();
                    warn!("crash flush of {} pipeline failed: {}", name, reason);
                }
                FlushStatus::TimedOut => {
                    report.timed_out += 1;
                    metrics::CRASH_FLUSHES.with_label_values(&[name.as_str(), "timeout"]).inc();
                    warn!(
                        "crash flush of {} pipeline did not finish within {:?}",
                        name, self.flush_timeout
                    );
                }
            }
        }
        report
    }
}

/// The panicking thread may be a runtime worker, so the flush gets a fresh
/// thread with its own single-threaded runtime.
fn flush_with_timeout(pipeline: Arc<dyn ForceFlush>, timeout: Duration) -> FlushStatus {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("crash-flush-{}", pipeline.name()))
        .spawn(move || {
            let result = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(pipeline.force_flush()),
                Err(e) => Err(ExportError::Task(e.to_string())),
            };
            let _ = tx.send(result);
        });
    if let Err(e) = spawned {
        return FlushStatus::Failed(format!("could not start flush thread: {}", e));
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(())) => FlushStatus::Flushed,
        Ok(Err(e)) => FlushStatus::Failed(e.to_string()),
        Err(RecvTimeoutError::Timeout) => FlushStatus::TimedOut,
        Err(RecvTimeoutError::Disconnected) => FlushStatus::Failed("flush panicked".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    enum Behaviour {
        Succeed,
        Fail,
        Hang,
        Panic,
    }

    struct FakePipeline {
        name: &'static str,
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl FakePipeline {
        fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name,
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ForceFlush for FakePipeline {
        fn name(&self) -> &str {
            self.name
        }

        async fn force_flush(&self) -> Result<(), ExportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(ExportError::Failed("collector unreachable".to_string())),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                Behaviour::Panic => panic!("exporter bug"),
            }
        }
    }

    #[test]
    fn test_failure_does_not_stop_other_flushes() {
        let trace = FakePipeline::new("trace", Behaviour::Succeed);
        let log = FakePipeline::new("log", Behaviour::Fail);
        let metric = FakePipeline::new("metric", Behaviour::Succeed);
        let coordinator = CrashFlushCoordinator::new(
            vec![trace.clone() as Arc<dyn ForceFlush>, log.clone(), metric.clone()],
            Duration::from_secs(5),
        );

        let report = coordinator.flush_all();
        assert_eq!(
            report,
            CrashFlushReport {
                flushed: 2,
                failed: 1,
                timed_out: 0
            }
        );
        for pipeline in [&trace, &log, &metric] {
            assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_hanging_flush_is_bounded() {
        let stuck = FakePipeline::new("trace", Behaviour::Hang);
        let after = FakePipeline::new("metric", Behaviour::Succeed);
        let coordinator = CrashFlushCoordinator::new(
            vec![stuck.clone() as Arc<dyn ForceFlush>, after.clone()],
            Duration::from_millis(100),
        );

        let started = std::time::Instant::now();
        let report = coordinator.flush_all();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.flushed, 1);
        assert_eq!(after.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_flush_counts_as_failure() {
        let broken = FakePipeline::new("log", Behaviour::Panic);
        let after = FakePipeline::new("metric", Behaviour::Succeed);
        let coordinator =
            CrashFlushCoordinator::new(vec![broken.clone() as Arc<dyn ForceFlush>, after.clone()], Duration::from_secs(5));

        let report = coordinator.flush_all();
        assert_eq!(report.failed, 1);
        assert_eq!(report.flushed, 1);
    }
}
