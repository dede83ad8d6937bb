//! Health Monitor - Passive sync diagnostics
//!
//! Aggregates independent checks into a list of issues, each tagged with
//! a severity and a human-readable suggested action:
//! - stale queue (oldest pending item too old) → warning, "sync now"
//! - token expiring or expired → error, "re-login"
//! - remote unreachable (recent cycle failures) → error
//! - excessive consecutive failures → error, escalated
//!
//! Checks are passive; nothing here touches the network. A periodic
//! timer runs only while sync is enabled and stops immediately when the
//! monitor is torn down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use chrono::Utc;

use crate::sync::coordinator::SyncCoordinator;
use crate::sync::models::{HealthIssue, HealthIssueKind, HealthSeverity, SyncEvent};

/// Oldest pending queue item age before the queue counts as stale
const STALE_QUEUE_THRESHOLD_SECS: i64 = 3600;

/// Token lifetime remaining below which we warn ahead of expiry
const TOKEN_EXPIRY_WARNING_SECS: i64 = 300;

/// Consecutive failures at which severity escalates
const EXCESSIVE_FAILURE_THRESHOLD: u32 = 5;

/// Health monitor errors
#[derive(Debug, thiserror::Error)]
pub enum HealthMonitorError {
    #[error("Health monitor is already running")]
    AlreadyRunning,

    #[error("Health monitor is not running")]
    NotRunning,

    #[error("Sync is disabled")]
    SyncDisabled,
}

/// Periodic, passive health diagnostics over the sync coordinator
pub struct HealthMonitor {
    coordinator: Arc<SyncCoordinator>,
    running: Arc<AtomicBool>,
    task_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor over the given coordinator.
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            coordinator,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: StdMutex::new(None),
        }
    }

    /// Run all diagnostics once and return the issues found.
    pub async fn check(&self) -> Vec<HealthIssue> {
        Self::run_checks(&self.coordinator).await
    }

    async fn run_checks(coordinator: &SyncCoordinator) -> Vec<HealthIssue> {
        let mut issues = Vec::new();
        let config = coordinator.get_config().await;
        let now = Utc::now();

        // Stale queue: oldest pending item older than the threshold
        if let Ok(stats) = coordinator.queue().stats() {
            if let Some(oldest) = stats.oldest_pending_at {
                let age = (now - oldest).num_seconds();
                if age > STALE_QUEUE_THRESHOLD_SECS {
                    issues.push(HealthIssue {
                        kind: HealthIssueKind::StaleQueue,
                        severity: HealthSeverity::Warning,
                        message: format!(
                            "{} pending changes, oldest has waited {} minutes",
                            stats.pending_count,
                            age / 60
                        ),
                        suggested_action: "Sync now".to_string(),
                    });
                }
            }
        }

        // Token validity (only meaningful with an active session)
        if config.enabled {
            match config.token_expires_at {
                Some(expires_at) if now.timestamp() >= expires_at => {
                    issues.push(HealthIssue {
                        kind: HealthIssueKind::TokenExpired,
                        severity: HealthSeverity::Error,
                        message: "Session token has expired".to_string(),
                        suggested_action: "Re-login".to_string(),
                    });
                }
                Some(expires_at)
                    if expires_at - now.timestamp() < TOKEN_EXPIRY_WARNING_SECS =>
                {
                    issues.push(HealthIssue {
                        kind: HealthIssueKind::TokenExpiring,
                        severity: HealthSeverity::Error,
                        message: format!(
                            "Session token expires in {} seconds",
                            expires_at - now.timestamp()
                        ),
                        suggested_action: "Re-login".to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    issues.push(HealthIssue {
                        kind: HealthIssueKind::TokenExpired,
                        severity: HealthSeverity::Error,
                        message: "No session token present".to_string(),
                        suggested_action: "Re-login".to_string(),
                    });
                }
            }
        }

        // Cycle failures: a few → remote unreachable; many → escalated
        if config.consecutive_failures >= EXCESSIVE_FAILURE_THRESHOLD {
            issues.push(HealthIssue {
                kind: HealthIssueKind::ExcessiveFailures,
                severity: HealthSeverity::Error,
                message: format!(
                    "{} consecutive sync failures (last: {})",
                    config.consecutive_failures,
                    config
                        .last_failure_reason
                        .as_deref()
                        .unwrap_or("unknown")
                ),
                suggested_action: "Check server status and credentials".to_string(),
            });
        } else if config.consecutive_failures > 0 {
            issues.push(HealthIssue {
                kind: HealthIssueKind::RemoteUnreachable,
                severity: HealthSeverity::Error,
                message: format!(
                    "Last sync failed: {}",
                    config
                        .last_failure_reason
                        .as_deref()
                        .unwrap_or("unknown")
                ),
                suggested_action: "Check network connectivity".to_string(),
            });
        }

        issues
    }

    /// Start the periodic timer.
    ///
    /// Refuses to start while sync is disabled; the loop also exits on
    /// its own as soon as it observes sync disabled.
    pub async fn start(&self, interval: Duration) -> Result<(), HealthMonitorError> {
        if self.running.load(Ordering::Relaxed) {
            return Err(HealthMonitorError::AlreadyRunning);
        }
        if !self.coordinator.is_enabled().await {
            return Err(HealthMonitorError::SyncDisabled);
        }

        self.running.store(true, Ordering::Relaxed);

        let running = self.running.clone();
        let coordinator = self.coordinator.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so issues right
            // after start don't double-report
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if !coordinator.is_enabled().await {
                    log::debug!("Health monitor stopping: sync disabled");
                    running.store(false, Ordering::Relaxed);
                    break;
                }

                for issue in Self::run_checks(&coordinator).await {
                    match issue.severity {
                        HealthSeverity::Warning => {
                            log::warn!("Health: {} ({})", issue.message, issue.suggested_action)
                        }
                        HealthSeverity::Error => {
                            log::error!("Health: {} ({})", issue.message, issue.suggested_action)
                        }
                    }
                    coordinator.emit_event(SyncEvent::HealthAlert { issue });
                }
            }

            log::debug!("Health monitor loop exited");
        });

        *self.task_handle.lock().unwrap() = Some(handle);
        log::info!("Health monitor started (interval: {:?})", interval);
        Ok(())
    }

    /// Stop the periodic timer immediately.
    pub fn stop(&self) -> Result<(), HealthMonitorError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(HealthMonitorError::NotRunning);
        }

        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.task_handle.lock().unwrap().take() {
            handle.abort();
        }

        log::info!("Health monitor stopped");
        Ok(())
    }

    /// Whether the periodic timer is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
