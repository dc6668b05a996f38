//! Single timer driving the dispatch sweep.
//!
//! The loop sleeps until the earliest due time, a fixed maximum interval, or
//! a wake signal from the state manager, whichever comes first, then asks
//! the work manager to sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::dispatcher::WorkManager;
use crate::state::StateManager;

pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);

pub struct TimeManager {
    state: Arc<StateManager>,
    work: Arc<WorkManager>,
    wake: Arc<Notify>,
    paused: AtomicBool,
    max_interval: Duration,
}

impl TimeManager {
    pub fn new(state: Arc<StateManager>, work: Arc<WorkManager>) -> Self {
        let wake = state.wake_signal();
        Self {
            state,
            work,
            wake,
            paused: AtomicBool::new(false),
            max_interval: DEFAULT_MAX_INTERVAL,
        }
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    /// Start the timer loop. It stops when `shutdown` is cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(shutdown).await })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        debug!("timer paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        debug!("timer resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Re-arm the timer against the current earliest due time.
    pub fn prime(&self) {
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let wait = if self.is_paused() {
                self.max_interval
            } else {
                let started = self.work.sweep().await;
                if started > 0 {
                    trace!(started, "dispatch sweep");
                }
                time_until(self.state.next_task_time(), Utc::now(), self.max_interval)
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("timer stopped");
    }
}

/// Time to sleep before the next sweep.
pub fn time_until(next_due: Option<DateTime<Utc>>, now: DateTime<Utc>, max_interval: Duration) -> Duration {
    match next_due {
        None => max_interval,
        Some(due) => (due - now).to_std().unwrap_or(Duration::ZERO).min(max_interval),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn sleeps_until_next_due_capped_by_max_interval() {
        let now = Utc::now();
        let max = Duration::from_secs(60);

        assert_eq!(time_until(None, now, max), max);
        assert_eq!(time_until(Some(now + ChronoDuration::seconds(5)), now, max), Duration::from_secs(5));
        assert_eq!(time_until(Some(now + ChronoDuration::hours(2)), now, max), max);
        assert_eq!(time_until(Some(now - ChronoDuration::seconds(5)), now, max), Duration::ZERO);
    }
}
