use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::{CallbackTask, TaskId};

/// Errors surfaced by persistence providers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not open")]
    NotOpen,

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt record for callback {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Durable store of callbacks that have not reached a terminal outcome.
///
/// Every operation is a single atomic unit of work. Removing an absent task
/// is not an error, and all instants are UTC.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Whether tasks survive a restart. The null provider returns `false`.
    fn is_durable(&self) -> bool {
        true
    }

    /// Create the backing store if absent, attach if present. Idempotent.
    async fn open(&self) -> Result<(), StoreError>;

    /// Release the backing store. Idempotent.
    async fn close(&self) -> Result<(), StoreError>;

    async fn add_task(&self, task: &CallbackTask) -> Result<(), StoreError>;

    async fn remove_task(&self, id: &TaskId) -> Result<(), StoreError>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<CallbackTask>, StoreError>;

    /// Full scan, used for recovery at startup.
    async fn list_all_tasks(&self) -> Result<Vec<CallbackTask>, StoreError>;

    /// Tasks due in `[start, end]`, ordered by due time then creation time.
    async fn list_tasks_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CallbackTask>, StoreError>;
}

/// Provider used when persistence is not configured: stores nothing.
#[derive(Debug, Default)]
pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskStore for NullStore {
    fn name(&self) -> &'static str {
        "none"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn open(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn add_task(&self, _task: &CallbackTask) -> Result<(), StoreError> {
        Ok(())
    }

    async fn remove_task(&self, _id: &TaskId) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_task(&self, _id: &TaskId) -> Result<Option<CallbackTask>, StoreError> {
        Ok(None)
    }

    async fn list_all_tasks(&self) -> Result<Vec<CallbackTask>, StoreError> {
        Ok(Vec::new())
    }

    async fn list_tasks_due_between(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<CallbackTask>, StoreError> {
        Ok(Vec::new())
    }
}

/// In-memory storage for tests and embedded use.
///
/// Survives a supervisor restart when the same instance is shared, not a
/// process restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tasks: Mutex<HashMap<TaskId, CallbackTask>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn add_task(&self, task: &CallbackTask) -> Result<(), StoreError> {
        self.tasks.lock().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn remove_task(&self, id: &TaskId) -> Result<(), StoreError> {
        self.tasks.lock().await.remove(id);
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<CallbackTask>, StoreError> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }

    async fn list_all_tasks(&self) -> Result<Vec<CallbackTask>, StoreError> {
        Ok(self.tasks.lock().await.values().cloned().collect())
    }

    async fn list_tasks_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CallbackTask>, StoreError> {
        let mut due: Vec<CallbackTask> = self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| t.due_time >= start && t.due_time <= end)
            .cloned()
            .collect();
        due.sort();
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use url::Url;

    fn task_due_in(secs: i64) -> CallbackTask {
        CallbackTask::new(
            Url::parse("http://app.test/cb").unwrap(),
            Utc::now() + Duration::seconds(secs),
            1,
        )
    }

    #[tokio::test]
    async fn null_store_keeps_nothing() {
        let store = NullStore::new();
        let task = task_due_in(0);
        store.add_task(&task).await.unwrap();
        assert!(store.get_task(&task.id).await.unwrap().is_none());
        assert!(store.list_all_tasks().await.unwrap().is_empty());
        assert!(!store.is_durable());
    }

    #[tokio::test]
    async fn memory_store_add_get_remove() {
        let store = InMemoryStore::new();
        let task = task_due_in(10);
        store.add_task(&task).await.unwrap();

        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.url, task.url);
        assert_eq!(loaded.attempts_remaining, 2);

        store.remove_task(&task.id).await.unwrap();
        store.remove_task(&task.id).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn memory_store_range_is_inclusive_and_sorted() {
        let store = InMemoryStore::new();
        let a = task_due_in(10);
        let b = task_due_in(5);
        let c = task_due_in(100);
        for t in [&a, &b, &c] {
            store.add_task(t).await.unwrap();
        }

        let due = store
            .list_tasks_due_between(b.due_time, a.due_time)
            .await
            .unwrap();
        let ids: Vec<TaskId> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }
}
