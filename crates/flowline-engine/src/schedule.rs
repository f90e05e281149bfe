//! Timer-driven ticks with a single-slot guard
//!
//! Each orchestrator owns one [`TickGuard`]. A tick that cannot take the
//! slot is dropped rather than queued, so runs of one orchestrator never
//! overlap. [`spawn_interval`] drives the ticks until it is cancelled; an
//! in-flight tick always runs to completion.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Non-blocking, single-slot mutual exclusion for ticks
#[derive(Debug, Clone, Default)]
pub struct TickGuard {
    slot: Arc<Mutex<()>>,
}

/// Held for the duration of one tick
pub type TickPermit = OwnedMutexGuard<()>;

impl TickGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot if it is free
    pub fn try_acquire(&self) -> Option<TickPermit> {
        Arc::clone(&self.slot).try_lock_owned().ok()
    }

    pub fn is_busy(&self) -> bool {
        self.slot.try_lock().is_err()
    }
}

/// Handle to a running interval loop
#[derive(Debug)]
pub struct ScheduleHandle {
    name: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    timer: JoinHandle<()>,
}

impl ScheduleHandle {
    /// Stop future ticks; ticks already running are left alone
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!(schedule = %self.name, "Stopping schedule");
            self.cancel.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop and wait for in-flight ticks to finish
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.timer.await {
            debug!(schedule = %self.name, error = %e, "Timer task ended abnormally");
        }
        self.tracker.close();
        self.tracker.wait().await;
        debug!(schedule = %self.name, "Schedule drained");
    }
}

/// Call `tick` every `period` on its own task until stopped.
///
/// The first tick fires immediately. Missed ticks are skipped rather than
/// bunched up after a stall.
pub fn spawn_interval<F, Fut>(name: impl Into<String>, period: Duration, tick: F) -> ScheduleHandle
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let timer = {
        let cancel = cancel.clone();
        let tracker = tracker.clone();
        let name = name.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(schedule = %name, period_ms = period.as_millis() as u64, "Schedule started");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        tracker.spawn(tick());
                    }
                }
            }

            info!(schedule = %name, "Schedule stopped");
        })
    };

    ScheduleHandle {
        name,
        cancel,
        tracker,
        timer,
    }
}
