//! Owner of the due-time index and the persistence layer.
//!
//! Every transition a callback goes through (add, cancel, dole, complete,
//! re-enlist) is made here so the in-memory index and the durable record
//! never drift apart. The index lock is only ever held for in-memory work;
//! persistence calls happen outside it.
//!
//! For a given callback the durable write always precedes the index insert,
//! and the index removal always precedes the durable delete, so a dispatch
//! can never complete a callback whose row has not been written yet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use url::Url;

use crate::index::{IndexError, SharedIndex};
use crate::storage::{StoreError, TaskStore};
use crate::telemetry::Telemetry;
use crate::types::{CallbackTask, TaskId};

/// How long a cancelled id is remembered.
pub const CANCELLATION_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

type ScheduleKey = (DateTime<Utc>, DateTime<Utc>);

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a cancellation request's URL is compared with the stored one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelMatch {
    /// The URLs must be identical.
    #[default]
    Exact,
    /// The requested URL may be a prefix of the stored URL.
    Prefix,
}

impl CancelMatch {
    pub fn matches(self, stored: &Url, requested: &Url) -> bool {
        match self {
            CancelMatch::Exact => stored.as_str() == requested.as_str(),
            CancelMatch::Prefix => stored.as_str().starts_with(requested.as_str()),
        }
    }
}

/// Ids cancelled while they may still be in flight, kept for a bounded time.
#[derive(Debug)]
pub struct CancellationLedger {
    retention: Duration,
    entries: Mutex<HashMap<TaskId, DateTime<Utc>>>,
}

impl Default for CancellationLedger {
    fn default() -> Self {
        Self::new(CANCELLATION_RETENTION)
    }
}

impl CancellationLedger {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, id: TaskId) {
        self.record_at(id, Utc::now());
    }

    pub fn record_at(&self, id: TaskId, now: DateTime<Utc>) {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::days(1));
        let mut entries = self.entries.lock();
        entries.retain(|_, expires| *expires > now);
        entries.insert(id, now + retention);
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.contains_at(id, Utc::now())
    }

    pub fn contains_at(&self, id: &TaskId, now: DateTime<Utc>) -> bool {
        self.entries.lock().get(id).is_some_and(|expires| *expires > now)
    }

    pub fn forget(&self, id: &TaskId) {
        self.entries.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

pub struct StateManager {
    index: SharedIndex<TaskId, ScheduleKey, CallbackTask>,
    store: Arc<dyn TaskStore>,
    telemetry: Arc<Telemetry>,
    cancellations: CancellationLedger,
    cancel_match: CancelMatch,
    wake: Arc<Notify>,
}

impl StateManager {
    pub fn new(store: Arc<dyn TaskStore>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            index: SharedIndex::new(),
            store,
            telemetry,
            cancellations: CancellationLedger::default(),
            cancel_match: CancelMatch::default(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_cancel_match(mut self, mode: CancelMatch) -> Self {
        self.cancel_match = mode;
        self
    }

    /// Signal raised whenever the earliest due time may have moved.
    pub fn wake_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Open persistence and load every stored callback into the index.
    ///
    /// Returns the number of callbacks recovered.
    pub async fn initialize(&self) -> Result<usize, StateError> {
        self.store.open().await?;

        if !self.store.is_durable() {
            warn!(
                provider = self.store.name(),
                "persistence is not configured; scheduled callbacks will not survive a restart"
            );
            self.telemetry.set_awaiting(self.index.len() as i64);
            self.wake.notify_one();
            return Ok(0);
        }

        let tasks = self.store.list_all_tasks().await?;
        let found = tasks.len();
        let recovered = self
            .index
            .push_all(tasks.into_iter().map(|t| (t.id, t.schedule_key(), t)));
        self.telemetry.set_awaiting(self.index.len() as i64);

        info!(
            provider = self.store.name(),
            recovered,
            skipped = found - recovered,
            "recovered scheduled callbacks"
        );
        self.wake.notify_one();
        Ok(recovered)
    }

    pub async fn close(&self) -> Result<(), StateError> {
        self.store.close().await?;
        Ok(())
    }

    pub async fn add_task(&self, task: CallbackTask) -> Result<(), StateError> {
        if self.index.contains(&task.id) {
            return Err(IndexError::DuplicateKey.into());
        }

        self.store.add_task(&task).await?;

        let id = task.id;
        self.index.push(id, task.schedule_key(), task)?;
        self.telemetry.awaiting_added(1);
        self.wake.notify_one();

        debug!(callback_id = %id, "callback scheduled");
        Ok(())
    }

    /// Cancel an awaiting callback.
    ///
    /// Returns `true` if a matching callback was found. A callback that has
    /// already been doled out is removed from persistence and recorded as
    /// cancelled; its in-flight attempt still runs.
    pub async fn cancel_task(&self, id: TaskId, url: &Url) -> Result<bool, StateError> {
        let mode = self.cancel_match;

        if let Some(task) = self.index.remove_if(&id, |t| mode.matches(&t.url, url)) {
            self.store.remove_task(&task.id).await?;
            self.cancellations.record(id);
            self.telemetry.awaiting_removed();
            self.telemetry.request_cancelled();
            self.wake.notify_one();
            debug!(callback_id = %id, "callback cancelled");
            return Ok(true);
        }

        if self.index.contains(&id) {
            debug!(callback_id = %id, "cancellation url does not match");
            return Ok(false);
        }

        match self.store.get_task(&id).await? {
            Some(stored) if mode.matches(&stored.url, url) => {
                self.store.remove_task(&id).await?;
                self.cancellations.record(id);
                self.telemetry.request_cancelled();
                debug!(callback_id = %id, "cancelled callback outside the index");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Pop the earliest callback if it is due at `now`.
    ///
    /// Callbacks with no attempts left, or cancelled while they were being
    /// re-enlisted, are discarded along the way.
    pub async fn dole_task(&self, now: DateTime<Utc>) -> Result<Option<CallbackTask>, StateError> {
        loop {
            let Some((id, _, task)) = self.index.pop_if(|(due, _)| *due <= now) else {
                return Ok(None);
            };

            if task.is_exhausted() {
                warn!(callback_id = %id, "discarding callback with no attempts remaining");
                self.store.remove_task(&id).await?;
                self.telemetry.awaiting_removed();
                continue;
            }

            if self.cancellations.contains(&id) {
                debug!(callback_id = %id, "discarding cancelled callback");
                self.complete_task(&task).await?;
                continue;
            }

            return Ok(Some(task));
        }
    }

    /// Remove a callback that reached a terminal outcome.
    pub async fn complete_task(&self, task: &CallbackTask) -> Result<(), StateError> {
        self.store.remove_task(&task.id).await?;
        self.cancellations.forget(&task.id);
        self.telemetry.awaiting_removed();
        Ok(())
    }

    /// Put a doled callback back into the index with a new due time.
    ///
    /// The durable record is rewritten first so the remaining attempts and
    /// the new due time survive a restart. If the callback was cancelled
    /// while in flight it is completed instead and `false` is returned.
    pub async fn reenlist_task(
        &self,
        mut task: CallbackTask,
        due_time: DateTime<Utc>,
    ) -> Result<bool, StateError> {
        if self.cancellations.contains(&task.id) {
            debug!(callback_id = %task.id, "dropping retry of cancelled callback");
            self.complete_task(&task).await?;
            return Ok(false);
        }

        task.due_time = due_time;
        self.store.add_task(&task).await?;
        if self.cancellations.contains(&task.id) {
            self.complete_task(&task).await?;
            return Ok(false);
        }
        self.index.push(task.id, task.schedule_key(), task)?;
        self.wake.notify_one();
        Ok(true)
    }

    pub fn next_task_time(&self) -> Option<DateTime<Utc>> {
        self.index.peek_priority().map(|(due, _)| due)
    }

    /// Number of callbacks waiting in the index.
    pub fn awaiting_count(&self) -> usize {
        self.index.len()
    }

    pub fn get_task(&self, id: &TaskId) -> Option<CallbackTask> {
        self.index.get(id)
    }

    pub fn is_cancelled(&self, id: &TaskId) -> bool {
        self.cancellations.contains(id)
    }

    /// Persisted callbacks due in `[start, end]`.
    pub async fn tasks_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CallbackTask>, StateError> {
        Ok(self.store.list_tasks_due_between(start, end).await?)
    }
}
