use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{DeliveryOutcome, FailureReason};
use crate::retry::RetryHeuristics;
use crate::state::StateManager;
use crate::telemetry::Telemetry;
use crate::types::CallbackTask;
use crate::worker::{build_http_client, deliver};

/// Consecutive failed hand-offs above which the dispatcher reports overload.
pub const OVERLOAD_THRESHOLD: u32 = 100;

/// Longest delay a single re-enlist can push a callback out.
pub const MAX_BACKOFF_DAYS: i64 = 3650;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent callback attempts.
    pub worker_count: usize,
    /// Per-attempt HTTP timeout.
    pub request_timeout: Duration,
    /// How long shutdown waits for in-flight attempts to settle.
    pub shutdown_grace: Duration,
    /// Delay before a callback that found no free worker is offered again.
    pub overload_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get() * 8)
            .unwrap_or(32);

        Self {
            worker_count,
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            overload_backoff: Duration::from_secs(1),
        }
    }
}

/// Pulls due callbacks from the state manager and runs them on a bounded pool.
///
/// Each doled callback is one attempt. A retryable failure re-enlists the
/// callback with a delay from [`RetryHeuristics`]; any other outcome
/// completes it.
pub struct WorkManager {
    state: Arc<StateManager>,
    retry: Arc<RetryHeuristics>,
    telemetry: Arc<Telemetry>,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    overloads: AtomicU32,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    config: DispatcherConfig,
}

impl WorkManager {
    pub fn new(
        state: Arc<StateManager>,
        retry: Arc<RetryHeuristics>,
        telemetry: Arc<Telemetry>,
        config: DispatcherConfig,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            state,
            retry,
            telemetry,
            client: build_http_client()?,
            permits: Arc::new(Semaphore::new(config.worker_count.max(1))),
            overloads: AtomicU32::new(0),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Token cancelled when the dispatcher shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn is_overloaded(&self) -> bool {
        self.overloads.load(Ordering::Relaxed) > OVERLOAD_THRESHOLD
    }

    pub fn in_flight(&self) -> usize {
        self.config.worker_count.max(1) - self.permits.available_permits()
    }

    /// Hand every due callback to a worker.
    ///
    /// Callbacks that find the pool full are offered again after the
    /// overload backoff without spending an attempt. A sweep that starts
    /// with a free worker clears the overload count. Returns the number of
    /// attempts started.
    pub async fn sweep(self: &Arc<Self>) -> usize {
        let mut started = 0;

        if self.permits.available_permits() > 0 {
            self.overloads.store(0, Ordering::Relaxed);
        }

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let task = match self.state.dole_task(now).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "failed to dole callback");
                    break;
                }
            };

            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => {
                    self.overloads.store(0, Ordering::Relaxed);
                    let this = Arc::clone(self);
                    self.tracker.spawn(async move { this.run(task, permit).await });
                    started += 1;
                }
                Err(_) => {
                    let count = self.overloads.fetch_add(1, Ordering::Relaxed) + 1;
                    self.telemetry.overloaded();
                    warn!(callback_id = %task.id, consecutive = count, "no free worker; deferring callback");

                    let later = backoff_from(now, self.config.overload_backoff);
                    if let Err(err) = self.state.reenlist_task(task, later).await {
                        error!(error = %err, "failed to defer callback");
                    }
                }
            }
        }

        started
    }

    async fn run(self: Arc<Self>, mut task: CallbackTask, permit: OwnedSemaphorePermit) {
        task.attempts_remaining = task.attempts_remaining.saturating_sub(1);

        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!(callback_id = %task.id, "attempt abandoned at shutdown");
                return;
            }
            outcome = deliver(&self.client, &task, self.config.request_timeout) => outcome,
        };

        // release the worker slot before any backoff bookkeeping
        drop(permit);

        self.settle(task, outcome).await;
    }

    async fn settle(&self, task: CallbackTask, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => {
                self.retry.on_success(&task.url);
                self.complete(&task).await;
                self.telemetry.callback_succeeded();
                debug!(callback_id = %task.id, url = %task.url, "callback delivered");
            }

            DeliveryOutcome::Failed(reason) if !reason.is_retryable() => {
                self.complete(&task).await;
                self.telemetry.callback_failed();
                error!(callback_id = %task.id, url = %task.url, reason = %reason, "callback failed");
            }

            DeliveryOutcome::Failed(reason) => {
                if task.is_exhausted() {
                    self.complete(&task).await;
                    self.telemetry.callback_failed();
                    error!(
                        callback_id = %task.id,
                        url = %task.url,
                        reason = %reason,
                        "callback failed; no attempts remaining"
                    );
                    return;
                }

                self.retry_later(task, reason).await;
            }
        }
    }

    async fn retry_later(&self, task: CallbackTask, reason: FailureReason) {
        let delay = self.retry.on_retryable_failure(&task.url);
        let due = backoff_from(Utc::now(), delay);
        let id = task.id;
        let url = task.url.clone();
        let attempts_remaining = task.attempts_remaining;

        match self.state.reenlist_task(task, due).await {
            Ok(true) => {
                self.telemetry.callback_retried();
                warn!(
                    callback_id = %id,
                    url = %url,
                    reason = %reason,
                    attempts_remaining,
                    retry_in_ms = delay.as_millis() as u64,
                    "callback attempt failed; retry scheduled"
                );
            }
            Ok(false) => {}
            Err(err) => error!(callback_id = %id, error = %err, "failed to re-enlist callback"),
        }
    }

    async fn complete(&self, task: &CallbackTask) {
        if let Err(err) = self.state.complete_task(task).await {
            error!(callback_id = %task.id, error = %err, "failed to complete callback");
        }
    }

    /// Cancel in-flight attempts and wait up to the grace period for them.
    ///
    /// Abandoned callbacks keep their durable record and are recovered on
    /// the next start.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(remaining = self.tracker.len(), "shutdown grace period elapsed");
        } else {
            info!("dispatcher stopped");
        }
    }
}

/// `now + delay`, with the delay capped at [`MAX_BACKOFF_DAYS`].
fn backoff_from(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let ceiling = chrono::Duration::days(MAX_BACKOFF_DAYS);
    let delta = chrono::Duration::from_std(delay).map_or(ceiling, |d| d.min(ceiling));
    now.checked_add_signed(delta).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStore, TaskStore};
    use url::Url;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        store: Arc<InMemoryStore>,
        state: Arc<StateManager>,
        telemetry: Arc<Telemetry>,
        work: Arc<WorkManager>,
    }

    fn fixture(config: DispatcherConfig, intervals: Vec<Duration>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let telemetry = Arc::new(Telemetry::new());
        let state = Arc::new(StateManager::new(store.clone(), telemetry.clone()));
        let retry = Arc::new(RetryHeuristics::new(intervals));
        let work = Arc::new(WorkManager::new(state.clone(), retry, telemetry.clone(), config).unwrap());
        Fixture { store, state, telemetry, work }
    }

    fn config(worker_count: usize) -> DispatcherConfig {
        DispatcherConfig {
            worker_count,
            request_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
            overload_backoff: Duration::from_secs(1),
        }
    }

    fn due_now(uri: &str, retry_count: u32) -> CallbackTask {
        CallbackTask::new(Url::parse(uri).unwrap(), Utc::now(), retry_count)
    }

    #[tokio::test]
    async fn success_completes_the_callback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let fx = fixture(config(4), vec![Duration::from_secs(10)]);
        fx.state.add_task(due_now(&server.uri(), 2)).await.unwrap();

        assert_eq!(fx.work.sweep().await, 1);
        fx.work.tracker().close();
        fx.work.tracker().wait().await;

        assert!(fx.store.is_empty().await);
        assert_eq!(fx.telemetry.snapshot().callbacks_succeeded, 1);
        assert_eq!(fx.telemetry.awaiting(), 0);
    }

    #[tokio::test]
    async fn rejection_is_final_despite_attempts_left() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fx = fixture(config(4), vec![Duration::ZERO]);
        fx.state.add_task(due_now(&server.uri(), 5)).await.unwrap();

        fx.work.sweep().await;
        fx.work.tracker().close();
        fx.work.tracker().wait().await;

        assert!(fx.store.is_empty().await);
        assert_eq!(fx.state.awaiting_count(), 0);
        assert_eq!(fx.telemetry.snapshot().callbacks_failed, 1);
    }

    #[tokio::test]
    async fn retryable_failure_reenlists_with_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fx = fixture(config(4), vec![Duration::from_secs(30)]);
        let task = due_now(&server.uri(), 1);
        fx.state.add_task(task.clone()).await.unwrap();

        fx.work.sweep().await;
        fx.work.tracker().close();
        fx.work.tracker().wait().await;

        let requeued = fx.state.get_task(&task.id).unwrap();
        assert_eq!(requeued.attempts_remaining, 1);
        assert!(requeued.due_time >= Utc::now() + chrono::Duration::seconds(25));
        assert!(fx.store.get_task(&task.id).await.unwrap().is_some());
        assert_eq!(fx.telemetry.snapshot().callbacks_retried, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_complete_as_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let fx = fixture(config(4), vec![Duration::ZERO]);
        fx.state.add_task(due_now(&server.uri(), 0)).await.unwrap();

        fx.work.sweep().await;
        fx.work.tracker().close();
        fx.work.tracker().wait().await;

        assert!(fx.store.is_empty().await);
        assert_eq!(fx.telemetry.snapshot().callbacks_failed, 1);
        assert_eq!(fx.telemetry.snapshot().callbacks_retried, 0);
    }

    #[tokio::test]
    async fn full_pool_defers_without_spending_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let fx = fixture(config(1), vec![Duration::ZERO]);
        let first = due_now(&server.uri(), 0);
        let second = due_now(&server.uri(), 0);
        fx.state.add_task(first).await.unwrap();
        fx.state.add_task(second.clone()).await.unwrap();

        assert_eq!(fx.work.sweep().await, 1);
        assert_eq!(fx.telemetry.snapshot().overloads, 1);
        assert!(!fx.work.is_overloaded());

        let deferred = fx.state.get_task(&second.id).unwrap();
        assert_eq!(deferred.attempts_remaining, 1);
        assert!(deferred.due_time > Utc::now());

        fx.work.shutdown().await;
    }

    /// Occupy the only worker, then refuse `OVERLOAD_THRESHOLD + 1` callbacks.
    async fn saturate(fx: &Fixture, uri: &str) -> Vec<CallbackTask> {
        let mut deferred = Vec::new();
        fx.state.add_task(due_now(uri, 0)).await.unwrap();
        for _ in 0..=OVERLOAD_THRESHOLD {
            let task = due_now(uri, 0);
            fx.state.add_task(task.clone()).await.unwrap();
            deferred.push(task);
        }

        assert_eq!(fx.work.sweep().await, 1);
        assert_eq!(fx.telemetry.snapshot().overloads, u64::from(OVERLOAD_THRESHOLD) + 1);
        assert!(fx.work.is_overloaded());
        deferred
    }

    async fn wait_for_idle_workers(work: &WorkManager) {
        for _ in 0..100 {
            if work.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("worker never became free");
    }

    async fn slow_target(delay: Duration) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(delay))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn refusals_past_threshold_raise_overload_until_a_worker_is_acquired() {
        let server = slow_target(Duration::from_millis(300)).await;
        let fx = fixture(config(1), vec![Duration::ZERO]);
        saturate(&fx, &server.uri()).await;

        wait_for_idle_workers(&fx.work).await;
        assert!(fx.work.is_overloaded());

        fx.state.add_task(due_now(&server.uri(), 0)).await.unwrap();
        assert_eq!(fx.work.sweep().await, 1);
        assert!(!fx.work.is_overloaded());

        fx.work.shutdown().await;
    }

    #[tokio::test]
    async fn overload_clears_when_deferred_callbacks_are_cancelled() {
        let server = slow_target(Duration::from_millis(300)).await;
        let fx = fixture(config(1), vec![Duration::ZERO]);
        let deferred = saturate(&fx, &server.uri()).await;

        for task in &deferred {
            assert!(fx.state.cancel_task(task.id, &task.url).await.unwrap());
        }
        wait_for_idle_workers(&fx.work).await;

        assert_eq!(fx.work.sweep().await, 0);
        assert!(!fx.work.is_overloaded());

        fx.work.shutdown().await;
    }

    #[test]
    fn backoff_is_capped() {
        let now = Utc::now();
        assert_eq!(backoff_from(now, Duration::from_secs(2)), now + chrono::Duration::seconds(2));
        assert_eq!(
            backoff_from(now, Duration::MAX),
            now + chrono::Duration::days(MAX_BACKOFF_DAYS)
        );
        assert_eq!(
            backoff_from(now, Duration::from_secs(u64::MAX / 2)),
            now + chrono::Duration::days(MAX_BACKOFF_DAYS)
        );
    }

    #[tokio::test]
    async fn shutdown_abandons_in_flight_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let fx = fixture(config(2), vec![Duration::ZERO]);
        let task = due_now(&server.uri(), 0);
        fx.state.add_task(task.clone()).await.unwrap();
        fx.work.sweep().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.work.shutdown().await;

        assert!(fx.work.tracker().is_empty());
        assert!(fx.store.get_task(&task.id).await.unwrap().is_some());
        assert_eq!(fx.work.sweep().await, 0);
    }
}
