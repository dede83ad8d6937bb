//! Database module for TaskSync
//!
//! Provides SQLite persistence for local task records, the sync queue,
//! sync history and settings. Uses r2d2 connection pooling; the sync
//! queue and history tables are owned by their respective modules and
//! created through the same `Database` handle.

use rusqlite::params;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use chrono::{DateTime, Utc};

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::sync::clock::VectorClock;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Schema for the tables owned by this module. The sync queue and
/// history tables are created by `sync::queue` and `sync::history`.
const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        payload TEXT,
        vector_clock TEXT NOT NULL,
        device_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_updated
        ON tasks(updated_at);

    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

/// A locally stored task record.
///
/// The payload is opaque JSON owned by the task editor; the sync core
/// only reads the identity, clock and timestamp columns. `payload` is
/// `None` for records that only exist as tombstones in transit.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct TaskRecord {
    pub id: String,

    /// Opaque task content (title, tags, subtasks, ...)
    pub payload: Option<serde_json::Value>,

    /// Causality clock for this record
    pub vector_clock: VectorClock,

    /// Device that produced the last mutation
    pub device_id: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a fresh record authored on the given device.
    pub fn new(id: String, payload: serde_json::Value, device_id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            payload: Some(payload),
            vector_clock: VectorClock::new().incremented(&device_id),
            device_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Database manager for thread-safe SQLite access
///
/// Uses r2d2 connection pooling. Cloning is cheap; all clones share the
/// same pool.
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool at the given path.
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(10)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        // Performance PRAGMAs
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        conn.execute_batch(SCHEMA)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing).
    ///
    /// The pool is capped at a single connection so every caller sees the
    /// same in-memory database.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool.
    ///
    /// Public so modules owning their own tables (queue, history) and
    /// callers needing multi-statement transactions can use it.
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // TASK RECORDS
    // =========================================================================

    /// Insert or replace a task record.
    pub fn upsert_task(&self, task: &TaskRecord) -> DbResult<()> {
        let clock = serde_json::to_string(&task.vector_clock)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let payload = match &task.payload {
            Some(v) => Some(
                serde_json::to_string(v).map_err(|e| DbError::Serialization(e.to_string()))?,
            ),
            None => None,
        };

        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO tasks (
                id, payload, vector_clock, device_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                task.id,
                payload,
                clock,
                task.device_id,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load a single task record by id.
    pub fn get_task(&self, id: &str) -> DbResult<Option<TaskRecord>> {
        let conn = self.get_conn()?;
        let result = conn.query_row(
            r#"
            SELECT id, payload, vector_clock, device_id, created_at, updated_at
            FROM tasks WHERE id = ?1
            "#,
            [id],
            map_task_row,
        );

        match result {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load all task records.
    pub fn list_tasks(&self) -> DbResult<Vec<TaskRecord>> {
        self.query(
            r#"
            SELECT id, payload, vector_clock, device_id, created_at, updated_at
            FROM tasks ORDER BY created_at ASC
            "#,
            params![],
            map_task_row,
        )
    }

    /// Delete a task record. Returns `true` if a row was removed.
    pub fn delete_task(&self, id: &str) -> DbResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    /// Number of locally stored task records.
    pub fn task_count(&self) -> DbResult<i64> {
        self.query_row("SELECT COUNT(*) FROM tasks", params![], |row| row.get(0))
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value (stored as JSON).
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value (stored as JSON).
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json =
            serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    /// Remove a setting. No-op if the key does not exist.
    pub fn delete_setting(&self, key: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }

    // =========================================================================
    // HELPER METHODS (for queue/history modules and internal use)
    // =========================================================================

    /// Execute a SQL statement and return affected rows.
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;
        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Execute a batch of SQL statements (schema setup).
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Execute an INSERT statement and return the last inserted row ID.
    pub fn execute_insert<P>(&self, sql: &str, params: P) -> DbResult<i64>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;
        conn.execute(sql, params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Query database and map results.
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query a single row.
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        conn.query_row(sql, params, f).map_err(DbError::from)
    }
}

/// Map a row of the tasks table into a `TaskRecord`.
fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let payload: Option<String> = row.get(1)?;
    let clock: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(TaskRecord {
        id: row.get(0)?,
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        vector_clock: serde_json::from_str(&clock)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        device_id: row.get(3)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
    })
}

// ============================================================================
// Tests
// ============================================================================
