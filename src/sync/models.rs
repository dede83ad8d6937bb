//! Sync Data Models - Client-Side Structures
//!
//! Defines the data structures shared across the sync subsystem:
//! - SyncConfig: session-scoped sync settings and failure bookkeeping
//! - Operation: the three local mutation kinds
//! - ConflictStrategy / ConflictInfo: conflict resolution contract
//! - SyncResult: the outcome handed to every sync caller
//! - SyncPhase / SyncTrigger / SyncEvent: state machine surface
//! - SyncStatusSnapshot: the UI-facing status poll

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::TaskRecord;

// ============================================================================
// Operations
// ============================================================================

/// Kind of local mutation awaiting transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Sync Configuration
// ============================================================================

/// Sync configuration and session state.
///
/// Created on successful authentication and persisted in the settings
/// table. Cleared entirely on logout, except that the queue is never
/// cleared, so pending local edits survive re-login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Whether sync is enabled (a session is active)
    pub enabled: bool,

    /// Account user ID from the sync server
    pub user_id: Option<String>,

    /// Unique device identifier (UUID v4)
    pub device_id: String,

    /// Device name (e.g. "MacBook Pro", "Office Desktop")
    pub device_name: String,

    /// Bearer token for the sync API
    pub auth_token: Option<String>,

    /// Refresh credential for the token endpoint
    pub refresh_token: Option<String>,

    /// Absolute token expiry, seconds since Unix epoch.
    ///
    /// The canonical unit is seconds; relative `expires_in` values are
    /// converted at the API boundary.
    pub token_expires_at: Option<i64>,

    /// Last successful sync timestamp
    pub last_sync_at: Option<DateTime<Utc>>,

    /// How concurrent edits are resolved
    pub conflict_strategy: ConflictStrategy,

    /// Consecutive failed cycles since the last success
    pub consecutive_failures: u32,

    /// Why the last cycle failed, if it did
    pub last_failure_reason: Option<String>,

    /// Automatic triggers are rejected before this instant
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Per-account key derivation salt (hex)
    pub key_salt: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_id: None,
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: default_device_name(),
            auth_token: None,
            refresh_token: None,
            token_expires_at: None,
            last_sync_at: None,
            conflict_strategy: ConflictStrategy::LastWriteWins,
            consecutive_failures: 0,
            last_failure_reason: None,
            next_retry_at: None,
            key_salt: None,
        }
    }
}

impl SyncConfig {
    /// Whether the bearer token has expired at the given instant.
    ///
    /// A missing expiry is treated as expired so a stale session cannot
    /// push silently.
    pub fn token_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.token_expires_at {
            Some(expires_at) => now.timestamp() >= expires_at,
            None => true,
        }
    }

    /// Whether the given instant falls inside the backoff window.
    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        matches!(self.next_retry_at, Some(at) if now < at)
    }

    /// Drop all session fields, keeping device identity and strategy.
    pub fn clear_session(&mut self) {
        self.enabled = false;
        self.user_id = None;
        self.auth_token = None;
        self.refresh_token = None;
        self.token_expires_at = None;
        self.last_sync_at = None;
        self.consecutive_failures = 0;
        self.last_failure_reason = None;
        self.next_retry_at = None;
        self.key_salt = None;
    }
}

/// Get default device name from hostname
fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Unknown Device".to_string())
}

// ============================================================================
// Conflict Resolution
// ============================================================================

/// Conflict resolution strategy for concurrent edits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Resolve deterministically by `updated_at`, tie-broken by device id
    LastWriteWins,

    /// Collect conflicts and return them to the caller unresolved
    Manual,
}

/// A concurrent edit the configured strategy declined to auto-resolve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub task_id: String,

    /// The local record at detection time
    pub local: TaskRecord,

    /// The decrypted remote record
    pub remote: TaskRecord,

    /// Human-readable description for the resolution UI
    pub detail: String,
}

/// The caller's verdict on a manual conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Keep the local record and push it back out
    KeepLocal,
    /// Overwrite local state with the remote record
    AcceptRemote,
}

// ============================================================================
// Sync Results
// ============================================================================

/// Tagged outcome of one sync cycle.
///
/// Every caller of `request_sync` receives exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncResult {
    Success {
        pushed_count: usize,
        pulled_count: usize,
    },
    Conflict {
        conflicts: Vec<ConflictInfo>,
    },
    Error {
        message: String,
        retryable: bool,
    },
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncResult::Success { .. })
    }

    pub fn has_conflicts(&self) -> bool {
        matches!(self, SyncResult::Conflict { conflicts } if !conflicts.is_empty())
    }
}

// ============================================================================
// State Machine Surface
// ============================================================================

/// Phase of the sync coordinator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Validating,
    Preparing,
    Pushing,
    Retrying,
    Pulling,
    Resolving,
    Finalizing,
    Backoff,
    AuthError,
    Manual,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Preparing => "preparing",
            Self::Pushing => "pushing",
            Self::Retrying => "retrying",
            Self::Pulling => "pulling",
            Self::Resolving => "resolving",
            Self::Finalizing => "finalizing",
            Self::Backoff => "backoff",
            Self::AuthError => "auth_error",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a sync cycle to be requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// User pressed the sync button
    Manual,
    /// Fixed background interval elapsed
    Interval,
    /// Application regained focus
    AppFocus,
    /// Network came back online
    NetworkOnline,
    /// Debounced delay after the most recent local edit
    LocalEdit,
    /// Application startup
    Startup,
}

impl SyncTrigger {
    /// Automatic triggers are rejected during the backoff window;
    /// manual ones are not.
    pub fn is_automatic(&self) -> bool {
        !matches!(self, SyncTrigger::Manual)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Interval => "interval",
            Self::AppFocus => "app_focus",
            Self::NetworkOnline => "network_online",
            Self::LocalEdit => "local_edit",
            Self::Startup => "startup",
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events broadcast to subscribers during synchronization
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A sync cycle began
    CycleStarted { trigger: SyncTrigger },
    /// The coordinator moved to a new phase
    PhaseChanged { phase: SyncPhase },
    /// A sync cycle finished with the given result
    CycleFinished { result: SyncResult },
    /// The health monitor raised an issue
    HealthAlert { issue: HealthIssue },
}

// ============================================================================
// Health Diagnostics
// ============================================================================

/// Severity of a health issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthSeverity {
    Warning,
    Error,
}

/// What the health monitor found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssueKind {
    StaleQueue,
    TokenExpiring,
    TokenExpired,
    RemoteUnreachable,
    ExcessiveFailures,
}

/// One diagnostic finding with a suggested user action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    pub kind: HealthIssueKind,
    pub severity: HealthSeverity,
    pub message: String,
    pub suggested_action: String,
}

/// Point-in-time status for the UI layer to poll or subscribe to
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusSnapshot {
    pub is_syncing: bool,
    pub phase: SyncPhase,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert!(!config.enabled);
        assert!(config.user_id.is_none());
        assert!(!config.device_id.is_empty());
        assert_eq!(config.conflict_strategy, ConflictStrategy::LastWriteWins);
        assert_eq!(config.consecutive_failures, 0);
    }

    #[test]
    fn test_default_configs_get_distinct_device_ids() {
        let a = SyncConfig::default();
        let b = SyncConfig::default();
        assert_ne!(a.device_id, b.device_id);
    }

    #[test]
    fn test_token_expiry_uses_seconds() {
        let now = Utc::now();
        let mut config = SyncConfig::default();

        config.token_expires_at = Some(now.timestamp() + 3600);
        assert!(!config.token_expired_at(now));

        config.token_expires_at = Some(now.timestamp() - 1);
        assert!(config.token_expired_at(now));

        // Missing expiry counts as expired
        config.token_expires_at = None;
        assert!(config.token_expired_at(now));
    }

    #[test]
    fn test_backoff_window() {
        let now = Utc::now();
        let mut config = SyncConfig::default();
        assert!(!config.in_backoff(now));

        config.next_retry_at = Some(now + chrono::Duration::seconds(60));
        assert!(config.in_backoff(now));

        config.next_retry_at = Some(now - chrono::Duration::seconds(1));
        assert!(!config.in_backoff(now));
    }

    #[test]
    fn test_clear_session_keeps_device_identity() {
        let mut config = SyncConfig::default();
        let device_id = config.device_id.clone();

        config.enabled = true;
        config.user_id = Some("user-1".to_string());
        config.auth_token = Some("token".to_string());
        config.consecutive_failures = 3;

        config.clear_session();

        assert!(!config.enabled);
        assert!(config.user_id.is_none());
        assert!(config.auth_token.is_none());
        assert_eq!(config.consecutive_failures, 0);
        assert_eq!(config.device_id, device_id);
    }

    #[test]
    fn test_operation_roundtrip() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(Operation::parse("upsert"), None);
    }

    #[test]
    fn test_trigger_automatic_classification() {
        assert!(!SyncTrigger::Manual.is_automatic());
        assert!(SyncTrigger::Interval.is_automatic());
        assert!(SyncTrigger::AppFocus.is_automatic());
        assert!(SyncTrigger::NetworkOnline.is_automatic());
        assert!(SyncTrigger::LocalEdit.is_automatic());
        assert!(SyncTrigger::Startup.is_automatic());
    }

    #[test]
    fn test_sync_result_accessors() {
        let ok = SyncResult::Success {
            pushed_count: 2,
            pulled_count: 3,
        };
        assert!(ok.is_success());
        assert!(!ok.has_conflicts());

        let err = SyncResult::Error {
            message: "offline".to_string(),
            retryable: true,
        };
        assert!(!err.is_success());

        let conflict = SyncResult::Conflict { conflicts: vec![] };
        assert!(!conflict.has_conflicts());
    }

    #[test]
    fn test_sync_result_serialization_tags() {
        let result = SyncResult::Error {
            message: "boom".to_string(),
            retryable: false,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains(r#""status":"error""#));
    }

    #[test]
    fn test_conflict_strategy_serde_names() {
        assert_eq!(
            serde_json::to_string(&ConflictStrategy::LastWriteWins).unwrap(),
            r#""last_write_wins""#
        );
        assert_eq!(
            serde_json::to_string(&ConflictStrategy::Manual).unwrap(),
            r#""manual""#
        );
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let mut config = SyncConfig::default();
        config.enabled = true;
        config.user_id = Some("user-1".to_string());
        config.token_expires_at = Some(1_700_000_000);

        let json = serde_json::to_string(&config).unwrap();
        let restored: SyncConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.user_id, config.user_id);
        assert_eq!(restored.token_expires_at, config.token_expires_at);
        assert_eq!(restored.device_id, config.device_id);
    }
}
