//! SQLite-backed task store.
//!
//! Connections come from a small `deadpool` pool; each unit of work checks a
//! connection out, runs on the blocking thread pool, and returns it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use deadpool::managed::{self, Metrics, RecycleResult};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension, Row};
use url::Url;

use crate::storage::{StoreError, TaskStore};
use crate::types::{CallbackTask, TaskId};

const DEFAULT_POOL_SIZE: usize = 4;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS callbacks (
        callback_id BLOB PRIMARY KEY,
        created_time TEXT NOT NULL,
        callback_time TEXT NOT NULL,
        callback_url TEXT NOT NULL,
        attempts_remaining INTEGER NOT NULL,
        authorization_cipher TEXT
    );
    CREATE INDEX IF NOT EXISTS callbacks_due
        ON callbacks (callback_time, created_time);
";

const SELECT_COLUMNS: &str = "SELECT callback_id, created_time, callback_time, callback_url, \
     attempts_remaining, authorization_cipher FROM callbacks";

/// Creates SQLite connections for the pool.
#[derive(Debug)]
pub struct ConnectionManager {
    path: PathBuf,
}

impl managed::Manager for ConnectionManager {
    type Type = Connection;
    type Error = rusqlite::Error;

    async fn create(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    async fn recycle(&self, conn: &mut Connection, _: &Metrics) -> RecycleResult<rusqlite::Error> {
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }
}

type Pool = managed::Pool<ConnectionManager>;

/// Durable store in a single SQLite database file.
pub struct SqliteStore {
    path: PathBuf,
    pool_size: usize,
    pool: RwLock<Option<Pool>>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pool_size: DEFAULT_POOL_SIZE,
            pool: RwLock::new(None),
        }
    }

    /// Build from a connection string: a file path, optionally prefixed with
    /// `sqlite://` or written as `Data Source=<path>`.
    pub fn from_connection_string(connection_string: &str) -> Self {
        Self::new(parse_connection_string(connection_string))
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pool(&self) -> Result<Pool, StoreError> {
        self.pool.read().clone().ok_or(StoreError::NotOpen)
    }

    async fn with_connection<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool()?;
        let mut conn = pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        tokio::task::spawn_blocking(move || work(&mut conn)).await?
    }
}

fn parse_connection_string(connection_string: &str) -> PathBuf {
    let trimmed = connection_string.trim();
    if let Some(rest) = trimmed.strip_prefix("sqlite://") {
        return PathBuf::from(rest);
    }
    for part in trimmed.split(';') {
        if let Some((key, value)) = part.split_once('=') {
            if key.trim().eq_ignore_ascii_case("data source") {
                return PathBuf::from(value.trim());
            }
        }
    }
    PathBuf::from(trimmed)
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn format_time(time: &DateTime<Utc>) -> String {
    // Fixed width, so lexical order in SQLite equals chronological order.
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("bad timestamp {raw:?}: {e}"),
        })
}

struct RawRow {
    id: Vec<u8>,
    created_time: String,
    callback_time: String,
    callback_url: String,
    attempts_remaining: i64,
    authorization_cipher: Option<String>,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            created_time: row.get(1)?,
            callback_time: row.get(2)?,
            callback_url: row.get(3)?,
            attempts_remaining: row.get(4)?,
            authorization_cipher: row.get(5)?,
        })
    }

    fn into_task(self) -> Result<CallbackTask, StoreError> {
        let id = TaskId::from_slice(&self.id).ok_or_else(|| StoreError::Corrupt {
            id: hex::encode(&self.id),
            reason: "callback id is not 16 bytes".into(),
        })?;
        let label = id.to_string();
        let url = Url::parse(&self.callback_url).map_err(|e| StoreError::Corrupt {
            id: label.clone(),
            reason: format!("bad url: {e}"),
        })?;
        let attempts_remaining =
            u32::try_from(self.attempts_remaining.max(0)).unwrap_or(u32::MAX);

        Ok(CallbackTask {
            id,
            url,
            due_time: parse_time(&label, &self.callback_time)?,
            created_time: parse_time(&label, &self.created_time)?,
            attempts_remaining,
            authorization_cipher: self.authorization_cipher,
        })
    }
}

fn collect_tasks(rows: Vec<RawRow>) -> Vec<CallbackTask> {
    rows.into_iter()
        .filter_map(|row| match row.into_task() {
            Ok(task) => Some(task),
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable callback record");
                None
            }
        })
        .collect()
}

#[async_trait]
impl TaskStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn open(&self) -> Result<(), StoreError> {
        if self.pool.read().is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        let manager = ConnectionManager {
            path: self.path.clone(),
        };
        let pool = Pool::builder(manager)
            .max_size(self.pool_size)
            .build()
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        {
            let mut guard = self.pool.write();
            if guard.is_some() {
                return Ok(());
            }
            *guard = Some(pool);
        }

        self.with_connection(|conn| conn.execute_batch(SCHEMA).map_err(backend))
            .await?;
        tracing::info!(path = %self.path.display(), "sqlite task store opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if let Some(pool) = self.pool.write().take() {
            pool.close();
        }
        Ok(())
    }

    async fn add_task(&self, task: &CallbackTask) -> Result<(), StoreError> {
        let id = task.id.as_bytes().to_vec();
        let created = format_time(&task.created_time);
        let due = format_time(&task.due_time);
        let url = task.url.to_string();
        let attempts = i64::from(task.attempts_remaining);
        let cipher = task.authorization_cipher.clone();

        self.with_connection(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            tx.execute(
                "INSERT OR REPLACE INTO callbacks
                    (callback_id, created_time, callback_time, callback_url, attempts_remaining, authorization_cipher)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, created, due, url, attempts, cipher],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)
        })
        .await
    }

    async fn remove_task(&self, id: &TaskId) -> Result<(), StoreError> {
        let id = id.as_bytes().to_vec();
        self.with_connection(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            tx.execute("DELETE FROM callbacks WHERE callback_id = ?1", params![id])
                .map_err(backend)?;
            tx.commit().map_err(backend)
        })
        .await
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<CallbackTask>, StoreError> {
        let key = id.as_bytes().to_vec();
        let row = self
            .with_connection(move |conn| {
                conn.query_row(
                    &format!("{SELECT_COLUMNS} WHERE callback_id = ?1"),
                    params![key],
                    RawRow::read,
                )
                .optional()
                .map_err(backend)
            })
            .await?;
        row.map(RawRow::into_task).transpose()
    }

    async fn list_all_tasks(&self) -> Result<Vec<CallbackTask>, StoreError> {
        let rows = self
            .with_connection(|conn| {
                let mut stmt = conn.prepare(SELECT_COLUMNS).map_err(backend)?;
                let rows = stmt
                    .query_map([], RawRow::read)
                    .map_err(backend)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(backend)?;
                Ok(rows)
            })
            .await?;
        Ok(collect_tasks(rows))
    }

    async fn list_tasks_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CallbackTask>, StoreError> {
        let start = format_time(&start);
        let end = format_time(&end);
        let rows = self
            .with_connection(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "{SELECT_COLUMNS} WHERE callback_time BETWEEN ?1 AND ?2 \
                         ORDER BY callback_time, created_time"
                    ))
                    .map_err(backend)?;
                let rows = stmt
                    .query_map(params![start, end], RawRow::read)
                    .map_err(backend)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(backend)?;
                Ok(rows)
            })
            .await?;
        Ok(collect_tasks(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn task(url: &str, due: DateTime<Utc>, retries: u32) -> CallbackTask {
        CallbackTask::new(Url::parse(url).unwrap(), due, retries)
    }

    async fn open_store(dir: &TempDir) -> SqliteStore {
        let store = SqliteStore::new(dir.path().join("callbacks.db"));
        store.open().await.unwrap();
        store
    }

    #[test]
    fn connection_string_forms() {
        assert_eq!(parse_connection_string("sqlite:///tmp/a.db"), PathBuf::from("/tmp/a.db"));
        assert_eq!(
            parse_connection_string("Data Source=/var/lib/cb.db;Mode=ReadWrite"),
            PathBuf::from("/var/lib/cb.db")
        );
        assert_eq!(parse_connection_string(" cb.db "), PathBuf::from("cb.db"));
    }

    #[tokio::test]
    async fn operations_require_open() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("closed.db"));
        assert!(matches!(store.list_all_tasks().await, Err(StoreError::NotOpen)));
    }

    #[tokio::test]
    async fn add_get_remove_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let stored = task("https://app.test/cb?x=1", Utc::now(), 3)
            .with_authorization_cipher("v=1,n=00,c=11");
        store.add_task(&stored).await.unwrap();

        let loaded = store.get_task(&stored.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, stored.id);
        assert_eq!(loaded.url, stored.url);
        assert_eq!(loaded.attempts_remaining, 4);
        assert_eq!(loaded.authorization_cipher.as_deref(), Some("v=1,n=00,c=11"));
        assert_eq!(loaded.due_time, stored.due_time);
        assert_eq!(loaded.created_time, stored.created_time);

        store.remove_task(&stored.id).await.unwrap();
        store.remove_task(&stored.id).await.unwrap();
        assert!(store.get_task(&stored.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_is_idempotent_and_reattaches() {
        let dir = TempDir::new().unwrap();
        let first = open_store(&dir).await;
        first.open().await.unwrap();
        let kept = task("http://app.test/a", Utc::now(), 0);
        first.add_task(&kept).await.unwrap();
        first.close().await.unwrap();
        first.close().await.unwrap();

        let second = open_store(&dir).await;
        let all = second.list_all_tasks().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, kept.id);
    }

    #[tokio::test]
    async fn due_range_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let base = Utc::now();

        let early = task("http://app.test/1", base, 0);
        let middle = task("http://app.test/2", base + Duration::minutes(5), 0);
        let late = task("http://app.test/3", base + Duration::minutes(10), 0);
        for t in [&late, &early, &middle] {
            store.add_task(t).await.unwrap();
        }

        let due = store
            .list_tasks_due_between(early.due_time, middle.due_time)
            .await
            .unwrap();
        let ids: Vec<TaskId> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![early.id, middle.id]);
    }

    #[tokio::test]
    async fn concurrent_writers_share_the_pool() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(open_store(&dir).await);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let t = task(&format!("http://app.test/{i}"), Utc::now(), 1);
                store.add_task(&t).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.list_all_tasks().await.unwrap().len(), 16);
    }
}
