//! Conflict Resolver - classifies pulled records against local state
//!
//! Each decrypted remote record is compared to the local copy using
//! vector clocks. Causally ordered records resolve trivially (newer side
//! wins); concurrent edits go through the configured strategy:
//! last-write-wins picks deterministically by `updated_at` with a
//! lexicographic device-id tie-break, manual collects the conflict and
//! hands it back to the caller unresolved.

use crate::db::TaskRecord;
use crate::sync::clock::ClockOrdering;
use crate::sync::models::{ConflictInfo, ConflictStrategy};

/// Verdict for one pulled record
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Local state wins; the remote record is discarded
    KeepLocal,
    /// Remote record wins; overwrite local state
    AcceptRemote,
    /// Concurrent edit under the manual strategy; caller must decide
    Manual(ConflictInfo),
}

impl Resolution {
    pub fn is_manual(&self) -> bool {
        matches!(self, Resolution::Manual(_))
    }
}

/// Stateless classification of remote records against local state
pub struct ConflictResolver;

impl ConflictResolver {
    /// Classify a pulled record against the local copy.
    ///
    /// `local` is `None` when the task has never been seen on this
    /// device, in which case the remote record is accepted outright.
    pub fn resolve(
        local: Option<&TaskRecord>,
        remote: &TaskRecord,
        strategy: ConflictStrategy,
    ) -> Resolution {
        let local = match local {
            Some(record) => record,
            None => return Resolution::AcceptRemote,
        };

        match local.vector_clock.compare(&remote.vector_clock) {
            // Local already incorporates everything the remote has seen
            ClockOrdering::Newer | ClockOrdering::Identical => Resolution::KeepLocal,

            // Remote strictly dominates
            ClockOrdering::Older => Resolution::AcceptRemote,

            ClockOrdering::Concurrent => match strategy {
                ConflictStrategy::LastWriteWins => Self::last_write_wins(local, remote),
                ConflictStrategy::Manual => Resolution::Manual(ConflictInfo {
                    task_id: remote.id.clone(),
                    local: local.clone(),
                    remote: remote.clone(),
                    detail: format!(
                        "Task '{}' was edited concurrently on this device and on '{}'",
                        remote.id, remote.device_id
                    ),
                }),
            },
        }
    }

    /// Deterministic resolution of a concurrent edit.
    ///
    /// Later `updated_at` wins; equal timestamps fall back to the
    /// lexicographically greater device id, so every device converges on
    /// the same choice regardless of which side it calls "local".
    fn last_write_wins(local: &TaskRecord, remote: &TaskRecord) -> Resolution {
        if remote.updated_at > local.updated_at {
            log::debug!(
                "LWW: remote wins for task {} ({} > {})",
                remote.id,
                remote.updated_at,
                local.updated_at
            );
            Resolution::AcceptRemote
        } else if remote.updated_at < local.updated_at {
            Resolution::KeepLocal
        } else if remote.device_id > local.device_id {
            log::debug!(
                "LWW: timestamp tie for task {}, device id '{}' beats '{}'",
                remote.id,
                remote.device_id,
                local.device_id
            );
            Resolution::AcceptRemote
        } else {
            Resolution::KeepLocal
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
