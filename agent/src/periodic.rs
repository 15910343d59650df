//! Recurring background work.
//!
//! The drain only needs "call this every `interval`" plus a way to stop. Hosts
//! with their own job scheduler implement [`PeriodicWork`]; otherwise
//! [`TokioPeriodicWork`] runs a ticker on the agent's runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type BoxedRun = Pin<Box<dyn Future<Output = ()> + Send>>;

pub type PeriodicTask = Arc<dyn Fn() -> BoxedRun + Send + Sync>;

pub trait PeriodicWork: Send + Sync {
    /// Run `task` every `interval` until the returned token is cancelled. The
    /// first run happens one interval after scheduling.
    fn schedule(&self, interval: Duration, task: PeriodicTask) -> CancellationToken;
}

#[derive(Debug, Clone)]
pub struct TokioPeriodicWork {
    handle: Handle,
}

impl TokioPeriodicWork {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl PeriodicWork for TokioPeriodicWork {
    fn schedule(&self, interval: Duration, task: PeriodicTask) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => task().await,
                }
            }
            debug!("periodic task cancelled");
        });
        token
    }
}
