//! # TaskSync
//!
//! The offline-first, end-to-end-encrypted multi-device synchronization
//! core of a task-management application. Edits made on any device while
//! disconnected reconcile into a consistent shared state without the
//! server ever seeing plaintext.
//!
//! The task editor UI, the login flow and the server implementation are
//! external; this crate owns the sync engine between them:
//!
//! - [`sync::CryptoManager`]: passphrase-derived key, AES-256-GCM
//! - [`sync::VectorClock`]: per-device causality tracking
//! - [`sync::SyncQueue`]: durable FIFO of pending local mutations
//! - [`sync::ConflictResolver`]: clock-based conflict classification
//! - [`sync::SyncCoordinator`]: the push/pull/resolve/finalize cycle
//! - [`sync::HealthMonitor`]: passive diagnostics
//! - [`sync::BackgroundSyncManager`]: interval/focus/online/edit triggers
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tasksync::db::Database;
//! use tasksync::sync::{Operation, SessionCredentials, SyncCoordinator, SyncTrigger};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Arc::new(Database::new("~/.tasksync/tasksync.db".into())?);
//!     let coordinator = SyncCoordinator::new(db.clone())?;
//!
//!     // Tokens come from the external login flow
//!     coordinator.login(credentials, "passphrase").await?;
//!
//!     coordinator
//!         .record_local_mutation(
//!             Operation::Create,
//!             "task-1",
//!             Some(serde_json::json!({"title": "Plant the garden"})),
//!         )
//!         .await?;
//!
//!     let result = coordinator.request_sync(SyncTrigger::Manual).await;
//!     println!("{:?}", result);
//!     Ok(())
//! }
//! ```

pub mod db;
pub mod sync;

pub use db::{Database, DbError, TaskRecord};
