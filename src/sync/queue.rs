//! Sync Queue Module - Durable log of pending local mutations
//!
//! Every local create/update/delete lands here before it is transmitted.
//! Items are drained in insertion order (FIFO) by the coordinator and
//! removed only after the remote acknowledges them, so edits made while
//! offline survive restarts, crashes and re-login.
//!
//! Features:
//! - SQLite-backed persistent queue
//! - Strict FIFO drain via an autoincrement sequence column
//! - Per-item retry counters for failed transmissions
//! - Idempotent bootstrap from the local task store

use crate::db::Database;
use crate::sync::clock::VectorClock;
use crate::sync::models::Operation;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Data Types
// ============================================================================

/// A pending local mutation awaiting remote acknowledgment.
///
/// Immutable once enqueued (apart from the retry counter) until it is
/// dequeued after a confirmed push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub operation: Operation,
    pub task_id: String,

    /// Opaque task content; `None` for deletes
    pub payload: Option<serde_json::Value>,

    /// Clock of the task at mutation time
    pub vector_clock: VectorClock,

    pub created_at: DateTime<Utc>,
    pub retry_count: i32,
}

/// Queue statistics for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: i64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub max_retry_count: i64,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<crate::db::DbError> for QueueError {
    fn from(e: crate::db::DbError) -> Self {
        QueueError::Database(e.to_string())
    }
}

// ============================================================================
// Sync Queue
// ============================================================================

/// Durable, ordered queue of pending local mutations
pub struct SyncQueue {
    db: Arc<Database>,
}

impl SyncQueue {
    /// Create a queue over the shared database, initializing its table.
    pub fn new(db: Arc<Database>) -> Result<Self, QueueError> {
        let queue = Self { db };
        queue.initialize_schema()?;
        Ok(queue)
    }

    /// Initialize database schema for the queue
    fn initialize_schema(&self) -> Result<(), QueueError> {
        self.db
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS sync_queue (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    operation TEXT NOT NULL,
                    task_id TEXT NOT NULL,
                    payload TEXT,
                    vector_clock TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_queue_task
                    ON sync_queue(task_id);
                "#,
            )
            .map_err(QueueError::from)?;
        Ok(())
    }

    /// Append a mutation to the queue.
    ///
    /// Multiple operations for the same task may coexist (an update
    /// followed by a delete, for instance); insertion order is preserved.
    pub fn enqueue(
        &self,
        operation: Operation,
        task_id: &str,
        payload: Option<serde_json::Value>,
        vector_clock: &VectorClock,
    ) -> Result<QueueItem, QueueError> {
        let item = QueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            task_id: task_id.to_string(),
            payload,
            vector_clock: vector_clock.clone(),
            created_at: Utc::now(),
            retry_count: 0,
        };

        let payload_json = match &item.payload {
            Some(v) => Some(
                serde_json::to_string(v).map_err(|e| QueueError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        let clock_json = serde_json::to_string(&item.vector_clock)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        self.db.execute(
            r#"
            INSERT INTO sync_queue (
                id, operation, task_id, payload, vector_clock, created_at, retry_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                item.id,
                item.operation.as_str(),
                item.task_id,
                payload_json,
                clock_json,
                item.created_at.to_rfc3339(),
                item.retry_count,
            ],
        )?;

        log::debug!(
            "Enqueued {} for task {} (queue item {})",
            item.operation,
            item.task_id,
            item.id
        );
        Ok(item)
    }

    /// All pending items in insertion order. An empty queue yields an
    /// empty vector, not an error.
    pub fn get_pending(&self) -> Result<Vec<QueueItem>, QueueError> {
        let items = self.db.query(
            r#"
            SELECT id, operation, task_id, payload, vector_clock, created_at, retry_count
            FROM sync_queue
            ORDER BY seq ASC
            "#,
            params![],
            map_queue_row,
        )?;
        Ok(items)
    }

    /// Every queued operation for a task, in original insertion order.
    pub fn get_for_task(&self, task_id: &str) -> Result<Vec<QueueItem>, QueueError> {
        let items = self.db.query(
            r#"
            SELECT id, operation, task_id, payload, vector_clock, created_at, retry_count
            FROM sync_queue
            WHERE task_id = ?1
            ORDER BY seq ASC
            "#,
            params![task_id],
            map_queue_row,
        )?;
        Ok(items)
    }

    /// Remove a single item. Removing a non-existent id is a no-op.
    pub fn dequeue(&self, id: &str) -> Result<(), QueueError> {
        let affected = self
            .db
            .execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
        if affected == 0 {
            log::debug!("Dequeue of unknown queue item {} ignored", id);
        }
        Ok(())
    }

    /// Remove exactly the listed items in one transaction.
    ///
    /// Returns the number actually removed; unknown ids are skipped.
    pub fn dequeue_bulk(&self, ids: &[String]) -> Result<usize, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.db.get_conn().map_err(QueueError::from)?;
        let tx = conn
            .transaction()
            .map_err(|e| QueueError::Database(e.to_string()))?;

        let mut removed = 0usize;
        for id in ids {
            removed += tx
                .execute("DELETE FROM sync_queue WHERE id = ?1", params![id])
                .map_err(|e| QueueError::Database(e.to_string()))?;
        }

        tx.commit()
            .map_err(|e| QueueError::Database(e.to_string()))?;

        log::debug!("Dequeued {} of {} acknowledged items", removed, ids.len());
        Ok(removed)
    }

    /// Bump an item's retry counter by one.
    ///
    /// No-op if the item no longer exists (it may have been dequeued
    /// concurrently).
    pub fn increment_retry(&self, id: &str) -> Result<(), QueueError> {
        self.db.execute(
            "UPDATE sync_queue SET retry_count = retry_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Reset every retry counter to zero (manual "try again" action).
    pub fn reset_retries(&self) -> Result<usize, QueueError> {
        let updated = self.db.execute(
            "UPDATE sync_queue SET retry_count = 0 WHERE retry_count > 0",
            params![],
        )?;
        Ok(updated)
    }

    /// Bootstrap: enqueue a `create` for every locally known task that has
    /// no queued operation yet.
    ///
    /// Idempotent: a second run enqueues nothing. Returns the number of
    /// items actually enqueued.
    pub fn populate_from_existing_tasks(&self) -> Result<usize, QueueError> {
        let missing = self.db.query(
            r#"
            SELECT id, payload, vector_clock FROM tasks
            WHERE payload IS NOT NULL
              AND id NOT IN (SELECT task_id FROM sync_queue)
            ORDER BY created_at ASC
            "#,
            params![],
            |row| {
                let id: String = row.get(0)?;
                let payload: Option<String> = row.get(1)?;
                let clock: String = row.get(2)?;
                Ok((id, payload, clock))
            },
        )?;

        let mut enqueued = 0usize;
        for (task_id, payload, clock_json) in missing {
            let payload: Option<serde_json::Value> =
                payload.and_then(|p| serde_json::from_str(&p).ok());
            let clock: VectorClock = serde_json::from_str(&clock_json)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;

            self.enqueue(Operation::Create, &task_id, payload, &clock)?;
            enqueued += 1;
        }

        if enqueued > 0 {
            log::info!("Queue bootstrap enqueued {} existing tasks", enqueued);
        }
        Ok(enqueued)
    }

    /// Queue statistics for the health monitor and status snapshot.
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let (pending_count, oldest, max_retry) = self.db.query_row(
            r#"
            SELECT COUNT(*), MIN(created_at), COALESCE(MAX(retry_count), 0)
            FROM sync_queue
            "#,
            params![],
            |row| {
                let count: i64 = row.get(0)?;
                let oldest: Option<String> = row.get(1)?;
                let max_retry: i64 = row.get(2)?;
                Ok((count, oldest, max_retry))
            },
        )?;

        Ok(QueueStats {
            pending_count,
            oldest_pending_at: oldest
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            max_retry_count: max_retry,
        })
    }

    /// Number of queued items.
    pub fn len(&self) -> Result<i64, QueueError> {
        let count = self
            .db
            .query_row("SELECT COUNT(*) FROM sync_queue", params![], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}

/// Map a row of the sync_queue table into a `QueueItem`.
fn map_queue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    let operation: String = row.get(1)?;
    let payload: Option<String> = row.get(3)?;
    let clock: String = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok(QueueItem {
        id: row.get(0)?,
        operation: Operation::parse(&operation).ok_or(rusqlite::Error::InvalidQuery)?,
        task_id: row.get(2)?,
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        vector_clock: serde_json::from_str(&clock).map_err(|_| rusqlite::Error::InvalidQuery)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        retry_count: row.get(6)?,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TaskRecord;
    use serde_json::json;

    fn test_queue() -> SyncQueue {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        SyncQueue::new(db).expect("Failed to create SyncQueue")
    }

    fn clock_a() -> VectorClock {
        VectorClock::new().incremented("device-a")
    }

    #[test]
    fn test_empty_queue() {
        let queue = test_queue();
        assert!(queue.get_pending().unwrap().is_empty());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_enqueue_and_get_pending() {
        let queue = test_queue();

        queue
            .enqueue(
                Operation::Create,
                "task-1",
                Some(json!({"title": "One"})),
                &clock_a(),
            )
            .unwrap();
        queue
            .enqueue(
                Operation::Update,
                "task-1",
                Some(json!({"title": "One, edited"})),
                &clock_a().incremented("device-a"),
            )
            .unwrap();

        let pending = queue.get_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].operation, Operation::Create);
        assert_eq!(pending[1].operation, Operation::Update);
    }

    #[test]
    fn test_fifo_order_preserved() {
        let queue = test_queue();

        for i in 0..10 {
            queue
                .enqueue(
                    Operation::Create,
                    &format!("task-{}", i),
                    Some(json!({"n": i})),
                    &clock_a(),
                )
                .unwrap();
        }

        let pending = queue.get_pending().unwrap();
        let ids: Vec<String> = pending.iter().map(|i| i.task_id.clone()).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("task-{}", i)).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_delete_has_no_payload() {
        let queue = test_queue();

        queue
            .enqueue(Operation::Delete, "task-1", None, &clock_a())
            .unwrap();

        let pending = queue.get_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].payload.is_none());
    }

    #[test]
    fn test_dequeue_removes_exactly_one() {
        let queue = test_queue();

        let a = queue
            .enqueue(Operation::Create, "task-1", Some(json!({})), &clock_a())
            .unwrap();
        queue
            .enqueue(Operation::Create, "task-2", Some(json!({})), &clock_a())
            .unwrap();

        queue.dequeue(&a.id).unwrap();

        let pending = queue.get_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "task-2");
    }

    #[test]
    fn test_dequeue_unknown_is_noop() {
        let queue = test_queue();
        queue.dequeue("no-such-id").unwrap();
    }

    #[test]
    fn test_dequeue_bulk_removes_exactly_listed() {
        let queue = test_queue();

        let a = queue
            .enqueue(Operation::Create, "task-1", Some(json!({})), &clock_a())
            .unwrap();
        let b = queue
            .enqueue(Operation::Create, "task-2", Some(json!({})), &clock_a())
            .unwrap();
        queue
            .enqueue(Operation::Create, "task-3", Some(json!({})), &clock_a())
            .unwrap();

        let removed = queue
            .dequeue_bulk(&[a.id, b.id, "ghost".to_string()])
            .unwrap();
        assert_eq!(removed, 2);

        let pending = queue.get_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "task-3");
    }

    #[test]
    fn test_dequeue_bulk_empty_list() {
        let queue = test_queue();
        assert_eq!(queue.dequeue_bulk(&[]).unwrap(), 0);
    }

    #[test]
    fn test_increment_retry() {
        let queue = test_queue();

        let item = queue
            .enqueue(Operation::Create, "task-1", Some(json!({})), &clock_a())
            .unwrap();

        queue.increment_retry(&item.id).unwrap();
        queue.increment_retry(&item.id).unwrap();

        let pending = queue.get_pending().unwrap();
        assert_eq!(pending[0].retry_count, 2);

        // Unknown id is a no-op
        queue.increment_retry("gone").unwrap();
    }

    #[test]
    fn test_reset_retries() {
        let queue = test_queue();

        let item = queue
            .enqueue(Operation::Create, "task-1", Some(json!({})), &clock_a())
            .unwrap();
        queue.increment_retry(&item.id).unwrap();

        let reset = queue.reset_retries().unwrap();
        assert_eq!(reset, 1);
        assert_eq!(queue.get_pending().unwrap()[0].retry_count, 0);
    }

    #[test]
    fn test_get_for_task_in_order() {
        let queue = test_queue();

        queue
            .enqueue(Operation::Create, "task-1", Some(json!({"v": 1})), &clock_a())
            .unwrap();
        queue
            .enqueue(Operation::Create, "task-2", Some(json!({})), &clock_a())
            .unwrap();
        queue
            .enqueue(
                Operation::Update,
                "task-1",
                Some(json!({"v": 2})),
                &clock_a().incremented("device-a"),
            )
            .unwrap();
        queue
            .enqueue(Operation::Delete, "task-1", None, &clock_a())
            .unwrap();

        let ops = queue.get_for_task("task-1").unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].operation, Operation::Create);
        assert_eq!(ops[1].operation, Operation::Update);
        assert_eq!(ops[2].operation, Operation::Delete);
    }

    #[test]
    fn test_populate_from_existing_tasks_idempotent() {
        let db = Arc::new(Database::in_memory().unwrap());
        let queue = SyncQueue::new(db.clone()).unwrap();

        for i in 0..3 {
            let task = TaskRecord::new(
                format!("task-{}", i),
                json!({"title": format!("Task {}", i)}),
                "device-a".to_string(),
            );
            db.upsert_task(&task).unwrap();
        }

        let first = queue.populate_from_existing_tasks().unwrap();
        assert_eq!(first, 3);
        assert_eq!(queue.len().unwrap(), 3);

        // Second run enqueues nothing
        let second = queue.populate_from_existing_tasks().unwrap();
        assert_eq!(second, 0);
        assert_eq!(queue.len().unwrap(), 3);
    }

    #[test]
    fn test_populate_skips_tasks_already_queued() {
        let db = Arc::new(Database::in_memory().unwrap());
        let queue = SyncQueue::new(db.clone()).unwrap();

        let task = TaskRecord::new(
            "task-1".to_string(),
            json!({"title": "Queued already"}),
            "device-a".to_string(),
        );
        db.upsert_task(&task).unwrap();
        queue
            .enqueue(
                Operation::Update,
                "task-1",
                task.payload.clone(),
                &task.vector_clock,
            )
            .unwrap();

        assert_eq!(queue.populate_from_existing_tasks().unwrap(), 0);
    }

    #[test]
    fn test_stats() {
        let queue = test_queue();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending_count, 0);
        assert!(stats.oldest_pending_at.is_none());

        let item = queue
            .enqueue(Operation::Create, "task-1", Some(json!({})), &clock_a())
            .unwrap();
        queue.increment_retry(&item.id).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending_count, 1);
        assert!(stats.oldest_pending_at.is_some());
        assert_eq!(stats.max_retry_count, 1);
    }

    #[test]
    fn test_clock_preserved_through_roundtrip() {
        let queue = test_queue();

        let clock: VectorClock = [("device-a".to_string(), 3u64), ("device-b".to_string(), 1u64)]
            .into_iter()
            .collect();
        queue
            .enqueue(Operation::Update, "task-1", Some(json!({})), &clock)
            .unwrap();

        let pending = queue.get_pending().unwrap();
        assert_eq!(pending[0].vector_clock, clock);
    }
}
