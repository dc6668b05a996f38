//! Application context: builds the managers and drives their lifecycle.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::authorization::{AuthorizationDecision, AuthorizationTable};
use crate::config::{ConfigError, ServiceConfig};
use crate::dispatcher::{DispatcherConfig, WorkManager};
use crate::error::ScheduleError;
use crate::retry::RetryHeuristics;
use crate::state::{CancelMatch, StateError, StateManager};
use crate::storage::TaskStore;
use crate::telemetry::Telemetry;
use crate::timer::{TimeManager, DEFAULT_MAX_INTERVAL};
use crate::types::{CallbackTask, TaskId};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Coarse service state reported by `/Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Paused,
    Idle,
    Active,
    Overloaded,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Paused => "paused",
            ServiceStatus::Idle => "idle",
            ServiceStatus::Active => "active",
            ServiceStatus::Overloaded => "overloaded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub retry_intervals: Vec<Duration>,
    pub dispatcher: DispatcherConfig,
    pub cancel_match: CancelMatch,
    /// Longest the timer sleeps without re-checking the index.
    pub timer_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            retry_intervals: vec![Duration::from_secs(10), Duration::from_secs(60), Duration::from_secs(300)],
            dispatcher: DispatcherConfig::default(),
            cancel_match: CancelMatch::default(),
            timer_interval: DEFAULT_MAX_INTERVAL,
        }
    }
}

struct Running {
    work: Arc<WorkManager>,
    timer: Arc<TimeManager>,
    timer_handle: JoinHandle<()>,
}

pub struct Supervisor {
    state: Arc<StateManager>,
    retry: Arc<RetryHeuristics>,
    telemetry: Arc<Telemetry>,
    authorization: AuthorizationTable,
    options: SupervisorOptions,
    paused: AtomicBool,
    running: RwLock<Option<Arc<Running>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        authorization: AuthorizationTable,
        options: SupervisorOptions,
    ) -> Self {
        let telemetry = Arc::new(Telemetry::new());
        let state = StateManager::new(store, Arc::clone(&telemetry)).with_cancel_match(options.cancel_match);
        Self {
            state: Arc::new(state),
            retry: Arc::new(RetryHeuristics::new(options.retry_intervals.clone())),
            telemetry,
            authorization,
            options,
            paused: AtomicBool::new(false),
            running: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, ConfigError> {
        let options = SupervisorOptions {
            retry_intervals: config.retry_intervals()?,
            dispatcher: config.dispatcher_config()?,
            cancel_match: config.cancel_match,
            timer_interval: DEFAULT_MAX_INTERVAL,
        };
        Ok(Self::new(config.build_store()?, config.authorization_table()?, options))
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn authorization(&self) -> &AuthorizationTable {
        &self.authorization
    }

    /// Recover persisted callbacks and start dispatching.
    ///
    /// Returns the number of callbacks recovered. Starting a running
    /// supervisor does nothing.
    pub async fn start(&self) -> Result<usize, SupervisorError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.running.read().is_some() {
            return Ok(0);
        }

        let recovered = self.state.initialize().await?;

        let work = Arc::new(WorkManager::new(
            Arc::clone(&self.state),
            Arc::clone(&self.retry),
            Arc::clone(&self.telemetry),
            self.options.dispatcher.clone(),
        )?);
        let timer = Arc::new(
            TimeManager::new(Arc::clone(&self.state), Arc::clone(&work))
                .with_max_interval(self.options.timer_interval),
        );
        if self.paused.load(Ordering::SeqCst) {
            timer.pause();
        }
        let timer_handle = timer.spawn(work.shutdown_token());

        *self.running.write() = Some(Arc::new(Running {
            work,
            timer,
            timer_handle,
        }));

        info!(recovered, workers = self.options.dispatcher.worker_count, "callback service started");
        Ok(recovered)
    }

    /// Stop dispatching, abandon in-flight attempts after the grace period,
    /// and close persistence.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(running) = self.running.write().take() else {
            return Ok(());
        };

        running.work.shutdown().await;
        match Arc::try_unwrap(running) {
            Ok(running) => {
                if let Err(err) = running.timer_handle.await {
                    warn!(error = %err, "timer task ended abnormally");
                }
            }
            Err(running) => running.timer_handle.abort(),
        }

        self.state.close().await?;
        info!("callback service stopped");
        Ok(())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        if let Some(running) = self.running() {
            running.timer.pause();
        }
        info!("callback dispatch paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        if let Some(running) = self.running() {
            running.timer.resume();
        }
        info!("callback dispatch resumed");
    }

    pub fn is_running(&self) -> bool {
        self.running.read().is_some()
    }

    pub fn status(&self) -> ServiceStatus {
        let Some(running) = self.running() else {
            return ServiceStatus::Stopped;
        };
        if running.timer.is_paused() {
            ServiceStatus::Paused
        } else if running.work.is_overloaded() {
            ServiceStatus::Overloaded
        } else if self.telemetry.awaiting() > 0 {
            ServiceStatus::Active
        } else {
            ServiceStatus::Idle
        }
    }

    /// Accept a callback request from `source`.
    pub async fn schedule(
        &self,
        url: Url,
        due_time: DateTime<Utc>,
        authorization_cipher: Option<String>,
        source: IpAddr,
    ) -> Result<TaskId, ScheduleError> {
        let running = self.running().ok_or(ScheduleError::NotRunning)?;

        let retry_count = match self.authorization.authorize(url.as_str(), source) {
            AuthorizationDecision::Allowed(policy) => policy.retry_count,
            AuthorizationDecision::Denied => return Err(ScheduleError::Unauthorized),
        };

        if running.work.is_overloaded() {
            return Err(ScheduleError::Overloaded);
        }

        let mut task = CallbackTask::new(url, due_time, retry_count);
        if let Some(cipher) = authorization_cipher {
            task = task.with_authorization_cipher(cipher);
        }
        let id = task.id;

        self.state.add_task(task).await?;
        self.telemetry.request_scheduled();
        Ok(id)
    }

    /// Cancel a callback on behalf of `source`.
    ///
    /// Returns whether a matching callback was found.
    pub async fn cancel(&self, id: TaskId, url: &Url, source: IpAddr) -> Result<bool, ScheduleError> {
        if !self.is_running() {
            return Err(ScheduleError::NotRunning);
        }
        if let AuthorizationDecision::Denied = self.authorization.authorize(url.as_str(), source) {
            return Err(ScheduleError::Unauthorized);
        }
        Ok(self.state.cancel_task(id, url).await?)
    }

    fn running(&self) -> Option<Arc<Running>> {
        self.running.read().clone()
    }
}
