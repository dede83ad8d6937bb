//! Sync History Module - Cycle Audit Trail
//!
//! Records one row per completed sync cycle:
//! - Trigger and outcome (success / conflict / error)
//! - Pushed, pulled and skipped (undecryptable) record counts
//! - Error message and cycle duration
//!
//! The health monitor and diagnostics UI read from here; a retention
//! policy keeps the table bounded.

use crate::db::Database;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Types & Structures
// ============================================================================

/// Outcome of a recorded sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    Success,
    Conflict,
    Error,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Success => "success",
            CycleOutcome::Conflict => "conflict",
            CycleOutcome::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(CycleOutcome::Success),
            "conflict" => Some(CycleOutcome::Conflict),
            "error" => Some(CycleOutcome::Error),
            _ => None,
        }
    }
}

/// A single recorded sync cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: Option<i64>,
    pub trigger: String,
    pub outcome: CycleOutcome,
    pub pushed: i64,
    pub pulled: i64,
    pub skipped: i64,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Database(String),
}

impl From<crate::db::DbError> for HistoryError {
    fn from(e: crate::db::DbError) -> Self {
        HistoryError::Database(e.to_string())
    }
}

// ============================================================================
// History Manager
// ============================================================================

/// Records and queries the sync cycle audit trail
pub struct HistoryManager {
    db: Arc<Database>,
}

impl HistoryManager {
    /// Create a manager over the shared database, initializing its table.
    pub fn new(db: Arc<Database>) -> Result<Self, HistoryError> {
        let manager = Self { db };
        manager.initialize_schema()?;
        Ok(manager)
    }

    /// Initialize database schema for history
    fn initialize_schema(&self) -> Result<(), HistoryError> {
        self.db
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS sync_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    trigger_kind TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    pushed INTEGER NOT NULL DEFAULT 0,
                    pulled INTEGER NOT NULL DEFAULT 0,
                    skipped INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    duration_ms INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_history_created
                    ON sync_history(created_at);
                "#,
            )
            .map_err(HistoryError::from)?;
        Ok(())
    }

    /// Record a completed cycle.
    pub fn record(&self, record: &CycleRecord) -> Result<i64, HistoryError> {
        let id = self
            .db
            .execute_insert(
                r#"
                INSERT INTO sync_history (
                    trigger_kind, outcome, pushed, pulled, skipped,
                    error, duration_ms, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    record.trigger,
                    record.outcome.as_str(),
                    record.pushed,
                    record.pulled,
                    record.skipped,
                    record.error,
                    record.duration_ms,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(HistoryError::from)?;

        log::debug!(
            "Recorded {} cycle (trigger: {}, pushed: {}, pulled: {})",
            record.outcome.as_str(),
            record.trigger,
            record.pushed,
            record.pulled
        );
        Ok(id)
    }

    /// The most recent cycles, newest first.
    pub fn recent(&self, limit: i64) -> Result<Vec<CycleRecord>, HistoryError> {
        let rows = self
            .db
            .query(
                r#"
                SELECT id, trigger_kind, outcome, pushed, pulled, skipped,
                       error, duration_ms, created_at
                FROM sync_history
                ORDER BY id DESC
                LIMIT ?1
                "#,
                params![limit],
                map_history_row,
            )
            .map_err(HistoryError::from)?;
        Ok(rows)
    }

    /// Delete rows older than the retention window. Returns rows removed.
    pub fn prune_older_than(&self, days: i64) -> Result<usize, HistoryError> {
        let cutoff = Utc::now() - Duration::days(days);
        let deleted = self
            .db
            .execute(
                "DELETE FROM sync_history WHERE created_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .map_err(HistoryError::from)?;

        if deleted > 0 {
            log::info!("Pruned {} sync history rows", deleted);
        }
        Ok(deleted)
    }

    /// Total recorded cycles.
    pub fn len(&self) -> Result<i64, HistoryError> {
        let count = self
            .db
            .query_row("SELECT COUNT(*) FROM sync_history", params![], |row| {
                row.get(0)
            })
            .map_err(HistoryError::from)?;
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, HistoryError> {
        Ok(self.len()? == 0)
    }
}

/// Map a row of the sync_history table into a `CycleRecord`.
fn map_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CycleRecord> {
    let outcome: String = row.get(2)?;
    let created_at: String = row.get(8)?;

    Ok(CycleRecord {
        id: row.get(0)?,
        trigger: row.get(1)?,
        outcome: CycleOutcome::parse(&outcome).ok_or(rusqlite::Error::InvalidQuery)?,
        pushed: row.get(3)?,
        pulled: row.get(4)?,
        skipped: row.get(5)?,
        error: row.get(6)?,
        duration_ms: row.get(7)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
    })
}

// ============================================================================
// Tests
// ============================================================================
