//! Sync Module - Offline-First Multi-Device Task Synchronization
//!
//! Provides end-to-end encrypted sync for task data:
//! - Local edits queue durably while offline
//! - Vector clocks detect concurrent edits across devices
//! - Conflicts resolve deterministically (last-write-wins) or are
//!   returned to the caller (manual)
//!
//! Architecture:
//! - Zero-Knowledge: the server only ever sees ciphertext
//! - E2E Encryption: AES-256-GCM under a PBKDF2-derived session key
//! - Single-flight coordination: one sync cycle per device at a time

pub mod api;
pub mod clock;
pub mod coordinator;
pub mod crypto;
pub mod health;
pub mod history;
pub mod models;
pub mod queue;
pub mod resolver;
pub mod scheduler;


// Re-export commonly used types
pub use api::{
    AuthResponse, DeviceResponse, EncryptedOperation, PullRequest, PullResponse, PushRequest,
    PushResponse, RemoteTask, SyncApiClient, SyncApiError,
};
pub use clock::{ClockOrdering, VectorClock};
pub use coordinator::{SessionCredentials, SyncCoordinator, SyncError};
pub use crypto::{
    compute_sha256, generate_salt, CryptoError, CryptoManager, EncryptedBlob, NONCE_LEN, SALT_LEN,
};
pub use health::{HealthMonitor, HealthMonitorError};
pub use history::{CycleOutcome, CycleRecord, HistoryError, HistoryManager};
pub use models::{
    ConflictChoice, ConflictInfo, ConflictStrategy, HealthIssue, HealthIssueKind, HealthSeverity,
    Operation, SyncConfig, SyncEvent, SyncPhase, SyncResult, SyncStatusSnapshot, SyncTrigger,
};
pub use queue::{QueueError, QueueItem, QueueStats, SyncQueue};
pub use resolver::{ConflictResolver, Resolution};
pub use scheduler::{BackgroundSyncManager, SchedulerConfig, SchedulerError};
