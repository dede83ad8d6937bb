//! Sync Coordinator - Orchestrates the full sync cycle
//!
//! Owns the sync state machine and everything it touches: the crypto
//! manager, the durable queue, the conflict resolver, the API client and
//! the persisted sync config. One instance is constructed after login and
//! passed by `Arc` to the scheduler and health monitor; there are no
//! global singletons.
//!
//! ```text
//! Idle → Validating → {Backoff | Preparing}
//!        Preparing  → {Pushing | AuthError}
//!        Pushing    → {Pulling | Retrying}
//!        Retrying   → {Pushing | AuthError}      (one refresh per cycle)
//!        Pulling    → Resolving
//!        Resolving  → {Finalizing | Manual}
//!        Finalizing → Idle
//! ```
//!
//! `Backoff`, `AuthError` and `Manual` terminate the cycle with a result
//! and return to `Idle`. Concurrent callers attach to the in-flight
//! cycle's result instead of starting a second one (single-flight).

use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::db::{Database, DbError, TaskRecord};
use crate::sync::api::{
    DeviceResponse, EncryptedOperation, PullRequest, PushRequest, RemoteTask, SyncApiClient,
    SyncApiError,
};
use crate::sync::clock::{ClockOrdering, VectorClock};
use crate::sync::crypto::{
    generate_salt, gzip_compress, gzip_decompress, CryptoError, CryptoManager, NONCE_LEN, SALT_LEN,
};
use crate::sync::history::{CycleOutcome, CycleRecord, HistoryError, HistoryManager};
use crate::sync::models::{
    ConflictChoice, ConflictInfo, Operation, SyncConfig, SyncEvent, SyncPhase, SyncResult,
    SyncStatusSnapshot, SyncTrigger,
};
use crate::sync::queue::{QueueError, QueueItem, SyncQueue};
use crate::sync::resolver::{ConflictResolver, Resolution};

use base64::Engine;

/// Initial retry delay after the first failed cycle
const BASE_RETRY_DELAY_SECS: i64 = 30;

/// Backoff ceiling
const MAX_RETRY_DELAY_SECS: i64 = 3600;

/// Page size for pull requests
const PULL_PAGE_SIZE: u32 = 100;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Settings key holding the persisted SyncConfig
const CONFIG_KEY: &str = "sync_config";

/// Settings key holding this device's authoritative vector clock
const DEVICE_CLOCK_KEY: &str = "device_vector_clock";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Sync is disabled")]
    SyncDisabled,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Authentication required: {0}")]
    Auth(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("API error: {0}")]
    Api(#[from] SyncApiError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Session Credentials
// ============================================================================

/// Tokens handed over by the (external) login flow.
///
/// The OAuth handshake itself is outside this crate; by the time these
/// arrive the user has authenticated.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Relative token lifetime in seconds, converted to an absolute
    /// expiry on arrival
    pub expires_in: i64,
    /// Per-account key derivation salt (hex) from the account record.
    /// `None` on first login; a fresh salt is generated and persisted.
    pub key_salt: Option<String>,
}

// ============================================================================
// Sync Coordinator
// ============================================================================

/// The session object owning all mutable sync state.
///
/// Constructed behind an `Arc` so a running cycle can outlive any single
/// caller: abandoning a `request_sync` future stops observing the cycle,
/// it never aborts it mid-mutation.
pub struct SyncCoordinator {
    db: Arc<Database>,
    api: Arc<SyncApiClient>,
    crypto: Arc<CryptoManager>,
    queue: Arc<SyncQueue>,
    history: Arc<HistoryManager>,
    config: Arc<RwLock<SyncConfig>>,
    phase: std::sync::RwLock<SyncPhase>,
    event_tx: broadcast::Sender<SyncEvent>,
    /// `Some` while a cycle is running; joiners subscribe for its result
    in_flight: Mutex<Option<broadcast::Sender<SyncResult>>>,
    /// Self-handle for spawning the cycle task
    weak: std::sync::Weak<SyncCoordinator>,
}

impl SyncCoordinator {
    /// Create a coordinator against the production API endpoint.
    pub fn new(db: Arc<Database>) -> Result<Arc<Self>, SyncError> {
        Self::with_api_client(db, SyncApiClient::new())
    }

    /// Create a coordinator with a specific API client (tests point it at
    /// a mock server).
    pub fn with_api_client(db: Arc<Database>, api: SyncApiClient) -> Result<Arc<Self>, SyncError> {
        let queue = SyncQueue::new(db.clone())?;
        let history = HistoryManager::new(db.clone())?;

        // Load the persisted config or create and persist a fresh one so
        // the device id is stable across restarts.
        let config = match db.get_setting::<SyncConfig>(CONFIG_KEY)? {
            Some(config) => config,
            None => {
                let config = SyncConfig::default();
                db.set_setting(CONFIG_KEY, &config)?;
                config
            }
        };

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new_cyclic(|weak| Self {
            db,
            api: Arc::new(api),
            crypto: Arc::new(CryptoManager::new()),
            queue: Arc::new(queue),
            history: Arc::new(history),
            config: Arc::new(RwLock::new(config)),
            phase: std::sync::RwLock::new(SyncPhase::Idle),
            event_tx,
            in_flight: Mutex::new(None),
            weak: weak.clone(),
        }))
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Install an authenticated session and derive the encryption key.
    ///
    /// The key derivation is CPU-bound and runs on a blocking thread so
    /// it does not stall the async executor. The per-account salt comes
    /// from the login flow's account record when available, else from a
    /// previously persisted value, else it is freshly generated.
    pub async fn login(
        &self,
        credentials: SessionCredentials,
        passphrase: &str,
    ) -> Result<(), SyncError> {
        let now = Utc::now();

        // Salt preference: the account's salt from the login flow, then
        // any still-persisted salt, then a fresh one (first login).
        let salt = match &credentials.key_salt {
            Some(hex_salt) => parse_salt(hex_salt)?,
            None => {
                let config = self.config.read().await;
                match &config.key_salt {
                    Some(hex_salt) => parse_salt(hex_salt)?,
                    None => generate_salt()?,
                }
            }
        };

        let crypto = self.crypto.clone();
        let passphrase = passphrase.to_string();
        tokio::task::spawn_blocking(move || crypto.derive_key(&passphrase, &salt))
            .await
            .map_err(|e| SyncError::Validation(format!("Key derivation task failed: {}", e)))??;

        self.api.set_token(credentials.access_token.clone()).await;

        let mut config = self.config.write().await;
        config.enabled = true;
        config.user_id = Some(credentials.user_id);
        config.auth_token = Some(credentials.access_token);
        config.refresh_token = Some(credentials.refresh_token);
        config.token_expires_at = Some(now.timestamp() + credentials.expires_in);
        config.key_salt = Some(hex::encode(salt));
        config.consecutive_failures = 0;
        config.next_retry_at = None;
        config.last_failure_reason = None;
        self.persist_config(&config)?;

        log::info!("Sync session established for device {}", config.device_id);
        Ok(())
    }

    /// Tear the session down: zero the key, clear tokens and config.
    ///
    /// The queue is intentionally left intact so edits made while logged
    /// out, or pending when logging out, survive re-login.
    pub async fn logout(&self) -> Result<(), SyncError> {
        self.api.clear_token().await;
        self.crypto.clear();

        let mut config = self.config.write().await;
        config.clear_session();
        self.persist_config(&config)?;

        log::info!("Sync session cleared");
        Ok(())
    }

    // ========================================================================
    // Local Mutations
    // ========================================================================

    /// Record a local edit: update the task store and enqueue the
    /// mutation for the next push.
    ///
    /// The device's counter in the record clock is incremented here,
    /// the only place this device ever advances it.
    pub async fn record_local_mutation(
        &self,
        operation: Operation,
        task_id: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<QueueItem, SyncError> {
        let device_id = self.config.read().await.device_id.clone();
        let now = Utc::now();

        let record = match operation {
            Operation::Create => {
                let payload = payload.ok_or_else(|| {
                    SyncError::Validation("Create requires a payload".to_string())
                })?;
                TaskRecord::new(task_id.to_string(), payload, device_id.clone())
            }
            Operation::Update => {
                let existing = self.db.get_task(task_id)?.ok_or_else(|| {
                    SyncError::Validation(format!("Unknown task: {}", task_id))
                })?;
                let payload = payload.ok_or_else(|| {
                    SyncError::Validation("Update requires a payload".to_string())
                })?;
                TaskRecord {
                    payload: Some(payload),
                    vector_clock: existing.vector_clock.incremented(&device_id),
                    device_id: device_id.clone(),
                    updated_at: now,
                    ..existing
                }
            }
            Operation::Delete => {
                let existing = self.db.get_task(task_id)?.ok_or_else(|| {
                    SyncError::Validation(format!("Unknown task: {}", task_id))
                })?;
                // Tombstone, not a hard delete: keeps the clock so stale
                // remote updates cannot resurrect the task.
                TaskRecord {
                    payload: None,
                    vector_clock: existing.vector_clock.incremented(&device_id),
                    device_id: device_id.clone(),
                    updated_at: now,
                    ..existing
                }
            }
        };

        self.db.upsert_task(&record)?;
        let item = self.queue.enqueue(
            operation,
            task_id,
            record.payload.clone(),
            &record.vector_clock,
        )?;
        Ok(item)
    }

    // ========================================================================
    // Sync Entry Point
    // ========================================================================

    /// Request a sync cycle.
    ///
    /// Single-flight: if a cycle is already running, this call attaches
    /// to it and returns the same result instead of starting another.
    ///
    /// The cycle itself runs on its own task; dropping this future stops
    /// observing the result but the in-flight network operations still
    /// complete and the queue is mutated consistently.
    pub async fn request_sync(&self, trigger: SyncTrigger) -> SyncResult {
        let mut guard = self.in_flight.lock().await;
        let attached = guard.as_ref().map(|tx| tx.subscribe());

        let mut rx = if let Some(rx) = attached {
            // Attach to the in-flight cycle's result
            drop(guard);
            log::debug!("Attaching {} trigger to in-flight cycle", trigger);
            rx
        } else {
            let (tx, rx) = broadcast::channel(1);
            *guard = Some(tx.clone());
            drop(guard);

            // &self proves an Arc is alive, so the upgrade holds
            let this = self
                .weak
                .upgrade()
                .expect("coordinator dropped while borrowed");
            tokio::spawn(async move {
                let _ = this.event_tx.send(SyncEvent::CycleStarted { trigger });
                let result = this.run_cycle(trigger).await;
                {
                    let mut guard = this.in_flight.lock().await;
                    *guard = None;
                }
                let _ = tx.send(result.clone());
                let _ = this.event_tx.send(SyncEvent::CycleFinished { result });
            });
            rx
        };

        match rx.recv().await {
            Ok(result) => result,
            Err(_) => SyncResult::Error {
                message: "Sync cycle ended without reporting a result".to_string(),
                retryable: true,
            },
        }
    }

    // ========================================================================
    // The Cycle
    // ========================================================================

    async fn run_cycle(&self, trigger: SyncTrigger) -> SyncResult {
        let started = Instant::now();
        let now = Utc::now();

        // ---- Validating ----------------------------------------------------
        self.set_phase(SyncPhase::Validating);
        let config = self.config.read().await.clone();

        if !config.enabled {
            self.set_phase(SyncPhase::Idle);
            return SyncResult::Error {
                message: "Sync is disabled".to_string(),
                retryable: false,
            };
        }
        if config.user_id.is_none() || config.auth_token.is_none() {
            self.set_phase(SyncPhase::Idle);
            return SyncResult::Error {
                message: "No active session".to_string(),
                retryable: false,
            };
        }
        if trigger.is_automatic() && config.in_backoff(now) {
            // Terminal for this cycle; no network activity, no counter bump
            self.set_phase(SyncPhase::Backoff);
            log::debug!(
                "Automatic {} trigger rejected during backoff (next retry at {:?})",
                trigger,
                config.next_retry_at
            );
            self.set_phase(SyncPhase::Idle);
            return SyncResult::Error {
                message: "Sync is backing off after repeated failures".to_string(),
                retryable: true,
            };
        }

        // ---- Preparing -----------------------------------------------------
        self.set_phase(SyncPhase::Preparing);

        if !self.crypto.is_initialized() {
            return self
                .fail(trigger, started, "Encryption key not initialized", false, 0, 0, 0)
                .await;
        }

        if let Err(e) = self.queue.populate_from_existing_tasks() {
            return self.fail(trigger, started, &e.to_string(), false, 0, 0, 0).await;
        }

        // The API token cache is in-memory; reinstall it from the config
        // in case this coordinator was freshly constructed.
        if let Some(token) = &config.auth_token {
            self.api.set_token(token.clone()).await;
        }

        // One token refresh attempt per cycle, whether spent here or in
        // the 401 path below.
        let mut refreshed = false;
        if config.token_expired_at(now) {
            log::info!("Bearer token expired, refreshing before push");
            match self.refresh_session().await {
                Ok(()) => refreshed = true,
                Err(e) => {
                    self.set_phase(SyncPhase::AuthError);
                    return self
                        .fail(
                            trigger,
                            started,
                            &format!("Token refresh failed: {}", e),
                            false,
                            0,
                            0,
                            0,
                        )
                        .await;
                }
            }
        }

        // ---- Pushing -------------------------------------------------------
        self.set_phase(SyncPhase::Pushing);

        let device_clock = self.load_device_clock();
        let pending = match self.queue.get_pending() {
            Ok(pending) => pending,
            Err(e) => {
                return self.fail(trigger, started, &e.to_string(), false, 0, 0, 0).await;
            }
        };

        let mut pushed_count = 0usize;
        let mut push_error: Option<String> = None;
        let mut server_clock: Option<VectorClock> = None;

        if !pending.is_empty() {
            // Item-level encryption failures are skipped, never fatal to
            // the batch.
            let mut operations = Vec::with_capacity(pending.len());
            let mut op_ids = Vec::with_capacity(pending.len());
            for item in &pending {
                match self.encrypt_item(item) {
                    Ok(op) => {
                        op_ids.push(item.id.clone());
                        operations.push(op);
                    }
                    Err(e) => {
                        log::warn!("Skipping unencryptable queue item {}: {}", item.id, e);
                    }
                }
            }

            if !operations.is_empty() {
                let request = PushRequest {
                    device_id: config.device_id.clone(),
                    operations,
                    vector_clock: device_clock.clone(),
                };

                loop {
                    match self.api.push(&request).await {
                        Ok(response) => {
                            let rejected_ids: HashSet<&str> =
                                response.rejected.iter().map(|r| r.id.as_str()).collect();
                            let accepted: Vec<String> = op_ids
                                .iter()
                                .filter(|id| !rejected_ids.contains(id.as_str()))
                                .cloned()
                                .collect();

                            // Remove only acknowledged items (atomically)
                            if let Err(e) = self.queue.dequeue_bulk(&accepted) {
                                return self
                                    .fail(trigger, started, &e.to_string(), false, 0, 0, 0)
                                    .await;
                            }
                            for rejected in &response.rejected {
                                log::warn!(
                                    "Server rejected operation {}: {}",
                                    rejected.id,
                                    rejected.reason
                                );
                                let _ = self.queue.increment_retry(&rejected.id);
                            }

                            pushed_count = accepted.len();
                            server_clock = Some(response.server_vector_clock);
                            break;
                        }
                        Err(SyncApiError::Unauthorized) if !refreshed => {
                            self.set_phase(SyncPhase::Retrying);
                            match self.refresh_session().await {
                                Ok(()) => {
                                    refreshed = true;
                                    self.set_phase(SyncPhase::Pushing);
                                    continue;
                                }
                                Err(e) => {
                                    self.set_phase(SyncPhase::AuthError);
                                    return self
                                        .fail(
                                            trigger,
                                            started,
                                            &format!("Token refresh failed: {}", e),
                                            false,
                                            0,
                                            0,
                                            0,
                                        )
                                        .await;
                                }
                            }
                        }
                        Err(SyncApiError::Unauthorized) => {
                            self.set_phase(SyncPhase::AuthError);
                            return self
                                .fail(
                                    trigger,
                                    started,
                                    "Authentication rejected after token refresh",
                                    false,
                                    0,
                                    0,
                                    0,
                                )
                                .await;
                        }
                        Err(e) if e.is_retryable() => {
                            // Items stay queued with bumped retry counters;
                            // the cycle still attempts the pull below.
                            log::warn!("Push failed, keeping {} items queued: {}", op_ids.len(), e);
                            for id in &op_ids {
                                let _ = self.queue.increment_retry(id);
                            }
                            push_error = Some(e.to_string());
                            break;
                        }
                        Err(e) => {
                            // Quota and malformed-response failures are fatal
                            return self
                                .fail(trigger, started, &e.to_string(), false, 0, 0, 0)
                                .await;
                        }
                    }
                }
            }
        }

        // ---- Pulling -------------------------------------------------------
        self.set_phase(SyncPhase::Pulling);

        let mut remote_records: Vec<TaskRecord> = Vec::new();
        let mut skipped = 0usize;
        let mut since_timestamp = config.last_sync_at;

        loop {
            let request = PullRequest {
                device_id: config.device_id.clone(),
                last_vector_clock: device_clock.clone(),
                since_timestamp,
                limit: PULL_PAGE_SIZE,
            };

            match self.api.pull(&request).await {
                Ok(response) => {
                    let page_latest = response.tasks.iter().map(|t| t.updated_at).max();
                    for remote in &response.tasks {
                        // Partial-failure isolation: one undecryptable
                        // record never aborts the batch.
                        match self.decrypt_remote(remote) {
                            Ok(record) => remote_records.push(record),
                            Err(e) => {
                                log::warn!(
                                    "Skipping undecryptable record {}: {}",
                                    remote.task_id,
                                    e
                                );
                                skipped += 1;
                            }
                        }
                    }

                    if !response.has_more {
                        break;
                    }
                    match page_latest {
                        Some(latest) => since_timestamp = Some(latest),
                        // Defensive: a hasMore page with no rows would loop
                        None => break,
                    }
                }
                Err(SyncApiError::Unauthorized) if !refreshed => {
                    match self.refresh_session().await {
                        Ok(()) => {
                            refreshed = true;
                            continue;
                        }
                        Err(e) => {
                            self.set_phase(SyncPhase::AuthError);
                            return self
                                .fail(
                                    trigger,
                                    started,
                                    &format!("Token refresh failed: {}", e),
                                    false,
                                    pushed_count,
                                    0,
                                    skipped,
                                )
                                .await;
                        }
                    }
                }
                Err(e) => {
                    let message = match &push_error {
                        Some(push_msg) => format!("Push failed ({}); pull failed: {}", push_msg, e),
                        None => format!("Pull failed: {}", e),
                    };
                    return self
                        .fail(
                            trigger,
                            started,
                            &message,
                            e.is_retryable(),
                            pushed_count,
                            0,
                            skipped,
                        )
                        .await;
                }
            }
        }

        // ---- Resolving -----------------------------------------------------
        self.set_phase(SyncPhase::Resolving);

        let mut pulled_count = 0usize;
        let mut conflicts: Vec<ConflictInfo> = Vec::new();
        let mut merged_clock = device_clock.clone();
        if let Some(server_clock) = &server_clock {
            merged_clock = merged_clock.merged(server_clock);
        }

        for remote in &remote_records {
            merged_clock = merged_clock.merged(&remote.vector_clock);

            let local = match self.db.get_task(&remote.id) {
                Ok(local) => local,
                Err(e) => {
                    return self
                        .fail(
                            trigger,
                            started,
                            &e.to_string(),
                            false,
                            pushed_count,
                            pulled_count,
                            skipped,
                        )
                        .await;
                }
            };

            match ConflictResolver::resolve(local.as_ref(), remote, config.conflict_strategy) {
                Resolution::AcceptRemote => {
                    if let Err(e) = self.apply_remote(remote, local.as_ref()) {
                        return self
                            .fail(
                                trigger,
                                started,
                                &e.to_string(),
                                false,
                                pushed_count,
                                pulled_count,
                                skipped,
                            )
                            .await;
                    }
                    pulled_count += 1;
                }
                Resolution::KeepLocal => {
                    // A concurrent edit we won: absorb the remote counters
                    // so the conflict cannot re-trigger on the next pull.
                    if let Some(local_record) = &local {
                        if local_record.vector_clock.compare(&remote.vector_clock)
                            == ClockOrdering::Concurrent
                        {
                            let mut kept = local_record.clone();
                            kept.vector_clock =
                                kept.vector_clock.merged(&remote.vector_clock);
                            if let Err(e) = self.db.upsert_task(&kept) {
                                log::warn!(
                                    "Failed to merge clock into kept record {}: {}",
                                    kept.id,
                                    e
                                );
                            }
                        }
                    }
                }
                Resolution::Manual(conflict) => conflicts.push(conflict),
            }
        }

        if !conflicts.is_empty() {
            self.set_phase(SyncPhase::Manual);
            log::warn!(
                "{} conflicts require manual resolution",
                conflicts.len()
            );
            self.record_history(
                trigger,
                started,
                CycleOutcome::Conflict,
                pushed_count,
                pulled_count,
                skipped,
                None,
            );
            self.set_phase(SyncPhase::Idle);
            return SyncResult::Conflict { conflicts };
        }

        // ---- Finalizing ----------------------------------------------------
        self.set_phase(SyncPhase::Finalizing);

        if let Some(message) = push_error {
            // Pull results were applied, but the cycle itself failed:
            // persist the merged clock, keep the failure bookkeeping.
            if let Err(e) = self.store_device_clock(&merged_clock) {
                log::warn!("Failed to persist device clock: {}", e);
            }
            return self
                .fail(
                    trigger,
                    started,
                    &message,
                    true,
                    pushed_count,
                    pulled_count,
                    skipped,
                )
                .await;
        }

        let final_clock = merged_clock.incremented(&config.device_id);
        if let Err(e) = self.store_device_clock(&final_clock) {
            return self
                .fail(
                    trigger,
                    started,
                    &e.to_string(),
                    false,
                    pushed_count,
                    pulled_count,
                    skipped,
                )
                .await;
        }

        {
            let mut config = self.config.write().await;
            config.last_sync_at = Some(Utc::now());
            config.consecutive_failures = 0;
            config.next_retry_at = None;
            config.last_failure_reason = None;
            if let Err(e) = self.persist_config(&config) {
                log::error!("Failed to persist sync config: {}", e);
            }
        }

        self.record_history(
            trigger,
            started,
            CycleOutcome::Success,
            pushed_count,
            pulled_count,
            skipped,
            None,
        );

        log::info!(
            "Sync cycle complete: pushed {}, pulled {}, skipped {} ({} ms)",
            pushed_count,
            pulled_count,
            skipped,
            started.elapsed().as_millis()
        );

        self.set_phase(SyncPhase::Idle);
        SyncResult::Success {
            pushed_count,
            pulled_count,
        }
    }

    // ========================================================================
    // Cycle Helpers
    // ========================================================================

    /// Terminal failure: bump the failure counters, compute the backoff
    /// window, record history and return the error result.
    async fn fail(
        &self,
        trigger: SyncTrigger,
        started: Instant,
        message: &str,
        retryable: bool,
        pushed: usize,
        pulled: usize,
        skipped: usize,
    ) -> SyncResult {
        let now = Utc::now();
        {
            let mut config = self.config.write().await;
            config.consecutive_failures += 1;
            config.last_failure_reason = Some(message.to_string());

            // base delay × 2^failures, capped
            let exponent = config.consecutive_failures.min(20);
            let delay = BASE_RETRY_DELAY_SECS
                .saturating_mul(1i64 << exponent)
                .min(MAX_RETRY_DELAY_SECS);
            config.next_retry_at = Some(now + Duration::seconds(delay));

            if let Err(e) = self.persist_config(&config) {
                log::error!("Failed to persist sync config: {}", e);
            }

            log::warn!(
                "Sync cycle failed ({} consecutive): {}; next retry after {}s",
                config.consecutive_failures,
                message,
                delay
            );
        }

        self.record_history(
            trigger,
            started,
            CycleOutcome::Error,
            pushed,
            pulled,
            skipped,
            Some(message),
        );

        self.set_phase(SyncPhase::Idle);
        SyncResult::Error {
            message: message.to_string(),
            retryable,
        }
    }

    fn record_history(
        &self,
        trigger: SyncTrigger,
        started: Instant,
        outcome: CycleOutcome,
        pushed: usize,
        pulled: usize,
        skipped: usize,
        error: Option<&str>,
    ) {
        let record = CycleRecord {
            id: None,
            trigger: trigger.as_str().to_string(),
            outcome,
            pushed: pushed as i64,
            pulled: pulled as i64,
            skipped: skipped as i64,
            error: error.map(|e| e.to_string()),
            duration_ms: started.elapsed().as_millis() as i64,
            created_at: Utc::now(),
        };
        if let Err(e) = self.history.record(&record) {
            log::warn!("Failed to record sync history: {}", e);
        }
    }

    /// Refresh the bearer token once and persist the new expiry.
    async fn refresh_session(&self) -> Result<(), SyncError> {
        let refresh_token = self
            .config
            .read()
            .await
            .refresh_token
            .clone()
            .ok_or_else(|| SyncError::Auth("No refresh token".to_string()))?;

        let auth = self.api.refresh_token(&refresh_token).await?;
        let now = Utc::now();

        let mut config = self.config.write().await;
        config.auth_token = Some(auth.access_token.clone());
        config.refresh_token = Some(auth.refresh_token.clone());
        config.token_expires_at = Some(auth.expires_at(now));
        self.persist_config(&config)?;

        log::info!("Bearer token refreshed");
        Ok(())
    }

    /// Encrypt a queue item into its wire form.
    fn encrypt_item(&self, item: &QueueItem) -> Result<EncryptedOperation, SyncError> {
        let (ciphertext, nonce) = match &item.payload {
            Some(payload) => {
                let plaintext = serde_json::to_vec(payload)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                let blob = self.crypto.encrypt(&plaintext)?;
                let compressed = gzip_compress(&blob.ciphertext)?;
                (
                    Some(base64::engine::general_purpose::STANDARD.encode(compressed)),
                    Some(base64::engine::general_purpose::STANDARD.encode(blob.nonce)),
                )
            }
            None => (None, None),
        };

        Ok(EncryptedOperation {
            id: item.id.clone(),
            operation: item.operation,
            task_id: item.task_id.clone(),
            ciphertext,
            nonce,
            vector_clock: item.vector_clock.clone(),
            timestamp: item.created_at,
        })
    }

    /// Decode and decrypt one pulled record into a task record.
    fn decrypt_remote(&self, remote: &RemoteTask) -> Result<TaskRecord, SyncError> {
        let payload = if remote.deleted {
            None
        } else {
            let ciphertext_b64 = remote
                .ciphertext
                .as_ref()
                .ok_or(SyncError::Crypto(CryptoError::DecryptionFailed))?;
            let nonce_b64 = remote
                .nonce
                .as_ref()
                .ok_or(SyncError::Crypto(CryptoError::DecryptionFailed))?;

            let compressed = base64::engine::general_purpose::STANDARD
                .decode(ciphertext_b64)
                .map_err(|_| SyncError::Crypto(CryptoError::DecryptionFailed))?;
            let ciphertext = gzip_decompress(&compressed)?;

            let nonce_bytes = base64::engine::general_purpose::STANDARD
                .decode(nonce_b64)
                .map_err(|_| SyncError::Crypto(CryptoError::DecryptionFailed))?;
            let nonce: [u8; NONCE_LEN] = nonce_bytes
                .try_into()
                .map_err(|_| SyncError::Crypto(CryptoError::DecryptionFailed))?;

            let plaintext = self.crypto.decrypt(&ciphertext, &nonce)?;
            let value: serde_json::Value = serde_json::from_slice(&plaintext)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            Some(value)
        };

        Ok(TaskRecord {
            id: remote.task_id.clone(),
            payload,
            vector_clock: remote.vector_clock.clone(),
            device_id: remote.device_id.clone(),
            created_at: remote.created_at,
            updated_at: remote.updated_at,
        })
    }

    /// Commit an accepted remote record to the local store.
    ///
    /// The stored clock is the merge of both sides so every device
    /// converges on the same clock for the surviving record. Tombstones
    /// are stored with an empty payload rather than deleting the row,
    /// keeping the clock available against stale resurrections.
    fn apply_remote(
        &self,
        remote: &TaskRecord,
        local: Option<&TaskRecord>,
    ) -> Result<(), SyncError> {
        let merged_clock = match local {
            Some(local) => local.vector_clock.merged(&remote.vector_clock),
            None => remote.vector_clock.clone(),
        };

        let record = TaskRecord {
            vector_clock: merged_clock,
            ..remote.clone()
        };
        self.db.upsert_task(&record)?;
        Ok(())
    }

    fn load_device_clock(&self) -> VectorClock {
        self.db
            .get_setting::<VectorClock>(DEVICE_CLOCK_KEY)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    fn store_device_clock(&self, clock: &VectorClock) -> Result<(), SyncError> {
        self.db.set_setting(DEVICE_CLOCK_KEY, clock)?;
        Ok(())
    }

    fn persist_config(&self, config: &SyncConfig) -> Result<(), SyncError> {
        self.db.set_setting(CONFIG_KEY, config)?;
        Ok(())
    }

    fn set_phase(&self, phase: SyncPhase) {
        {
            let mut guard = self.phase.write().unwrap_or_else(|e| e.into_inner());
            if *guard == phase {
                return;
            }
            *guard = phase;
        }
        log::debug!("Sync phase: {}", phase);
        let _ = self.event_tx.send(SyncEvent::PhaseChanged { phase });
    }

    // ========================================================================
    // Conflict Resolution
    // ========================================================================

    /// Commit the caller's verdict on a manual conflict.
    pub async fn resolve_conflict(
        &self,
        conflict: &ConflictInfo,
        choice: ConflictChoice,
    ) -> Result<(), SyncError> {
        match choice {
            ConflictChoice::AcceptRemote => {
                let local = self.db.get_task(&conflict.task_id)?;
                self.apply_remote(&conflict.remote, local.as_ref())?;
                log::info!("Conflict on {} resolved: accepted remote", conflict.task_id);
            }
            ConflictChoice::KeepLocal => {
                let device_id = self.config.read().await.device_id.clone();
                let local = self.db.get_task(&conflict.task_id)?.ok_or_else(|| {
                    SyncError::Validation(format!("Unknown task: {}", conflict.task_id))
                })?;

                // Absorb the remote counters and advance our own so the
                // kept version dominates on every device.
                let record = TaskRecord {
                    vector_clock: local
                        .vector_clock
                        .merged(&conflict.remote.vector_clock)
                        .incremented(&device_id),
                    device_id: device_id.clone(),
                    updated_at: Utc::now(),
                    ..local
                };
                self.db.upsert_task(&record)?;
                self.queue.enqueue(
                    Operation::Update,
                    &record.id,
                    record.payload.clone(),
                    &record.vector_clock,
                )?;
                log::info!("Conflict on {} resolved: kept local", conflict.task_id);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Status & Introspection
    // ========================================================================

    /// Subscribe to sync events (cycle lifecycle, phase changes, health
    /// alerts). Multiple subscribers each get every event in order.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit_event(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Current phase of the state machine.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Point-in-time status for the UI layer.
    pub async fn status(&self) -> SyncStatusSnapshot {
        let config = self.config.read().await.clone();
        let phase = self.phase();
        let pending_count = self.queue.len().unwrap_or(0);

        SyncStatusSnapshot {
            is_syncing: phase != SyncPhase::Idle,
            phase,
            last_sync_at: config.last_sync_at,
            pending_count,
            next_retry_at: config.next_retry_at,
            retry_count: config.consecutive_failures,
            error: config.last_failure_reason,
        }
    }

    /// Get a copy of the current sync config.
    pub async fn get_config(&self) -> SyncConfig {
        self.config.read().await.clone()
    }

    /// Replace the sync config (e.g. switching conflict strategy).
    pub async fn update_config(&self, new_config: SyncConfig) -> Result<(), SyncError> {
        let mut config = self.config.write().await;
        *config = new_config;
        self.persist_config(&config)
    }

    /// Whether sync is enabled (a session is active).
    pub async fn is_enabled(&self) -> bool {
        self.config.read().await.enabled
    }

    /// The crypto manager (shared with the health monitor).
    pub fn crypto(&self) -> &Arc<CryptoManager> {
        &self.crypto
    }

    /// The durable queue.
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// The cycle history.
    pub fn history(&self) -> &Arc<HistoryManager> {
        &self.history
    }

    // ========================================================================
    // Device Management
    // ========================================================================

    /// List all devices registered to this account.
    pub async fn list_devices(&self) -> Result<Vec<DeviceResponse>, SyncError> {
        Ok(self.api.list_devices().await?)
    }

    /// Revoke a device's access.
    pub async fn revoke_device(&self, device_id: &str) -> Result<(), SyncError> {
        Ok(self.api.revoke_device(device_id).await?)
    }
}

/// Parse a persisted hex salt back into bytes.
fn parse_salt(hex_salt: &str) -> Result<[u8; SALT_LEN], SyncError> {
    let bytes = hex::decode(hex_salt)
        .map_err(|_| SyncError::Validation("Invalid salt format".to_string()))?;
    bytes
        .try_into()
        .map_err(|_| SyncError::Validation("Invalid salt length".to_string()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_coordinator() -> Arc<SyncCoordinator> {
        let db = Arc::new(Database::in_memory().expect("Failed to create test database"));
        SyncCoordinator::new(db).expect("Failed to create coordinator")
    }

    fn test_credentials() -> SessionCredentials {
        SessionCredentials {
            user_id: "user-1".to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_in: 3600,
            key_salt: None,
        }
    }

    #[tokio::test]
    async fn test_coordinator_creation_persists_device_id() {
        let db = Arc::new(Database::in_memory().unwrap());
        let device_id = {
            let coordinator = SyncCoordinator::new(db.clone()).unwrap();
            coordinator.get_config().await.device_id
        };

        // A second coordinator over the same database keeps the identity
        let coordinator = SyncCoordinator::new(db).unwrap();
        assert_eq!(coordinator.get_config().await.device_id, device_id);
    }

    #[tokio::test]
    async fn test_sync_disabled_without_session() {
        let coordinator = test_coordinator();
        let result = coordinator.request_sync(SyncTrigger::Manual).await;

        match result {
            SyncResult::Error { retryable, .. } => assert!(!retryable),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_initializes_key_and_session() {
        let coordinator = test_coordinator();
        coordinator
            .login(test_credentials(), "passphrase")
            .await
            .unwrap();

        assert!(coordinator.crypto().is_initialized());
        let config = coordinator.get_config().await;
        assert!(config.enabled);
        assert_eq!(config.user_id.as_deref(), Some("user-1"));
        assert!(config.key_salt.is_some());
        assert!(config.token_expires_at.unwrap() > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_logout_clears_key_but_not_queue() {
        let coordinator = test_coordinator();
        coordinator
            .login(test_credentials(), "passphrase")
            .await
            .unwrap();

        coordinator
            .record_local_mutation(Operation::Create, "task-1", Some(json!({"title": "Pending"})))
            .await
            .unwrap();

        coordinator.logout().await.unwrap();

        assert!(!coordinator.crypto().is_initialized());
        assert!(!coordinator.is_enabled().await);
        // Pending local edits survive logout
        assert_eq!(coordinator.queue().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_logout_forgets_salt_and_relogin_generates_one() {
        let coordinator = test_coordinator();
        coordinator
            .login(test_credentials(), "passphrase")
            .await
            .unwrap();
        assert!(coordinator.get_config().await.key_salt.is_some());

        coordinator.logout().await.unwrap();
        assert!(coordinator.get_config().await.key_salt.is_none());

        coordinator
            .login(test_credentials(), "passphrase")
            .await
            .unwrap();
        assert!(coordinator.get_config().await.key_salt.is_some());
        assert!(coordinator.crypto().is_initialized());
    }

    #[tokio::test]
    async fn test_record_local_mutation_create() {
        let coordinator = test_coordinator();

        let item = coordinator
            .record_local_mutation(Operation::Create, "task-1", Some(json!({"title": "New"})))
            .await
            .unwrap();

        assert_eq!(item.operation, Operation::Create);
        let config = coordinator.get_config().await;
        assert_eq!(item.vector_clock.get(&config.device_id), 1);

        let db_record = coordinator.db.get_task("task-1").unwrap().unwrap();
        assert_eq!(db_record.vector_clock.get(&config.device_id), 1);
    }

    #[tokio::test]
    async fn test_record_local_mutation_update_increments_clock() {
        let coordinator = test_coordinator();
        let device_id = coordinator.get_config().await.device_id;

        coordinator
            .record_local_mutation(Operation::Create, "task-1", Some(json!({"v": 1})))
            .await
            .unwrap();
        let item = coordinator
            .record_local_mutation(Operation::Update, "task-1", Some(json!({"v": 2})))
            .await
            .unwrap();

        assert_eq!(item.vector_clock.get(&device_id), 2);
        assert_eq!(coordinator.queue().len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_record_local_mutation_delete_leaves_tombstone() {
        let coordinator = test_coordinator();

        coordinator
            .record_local_mutation(Operation::Create, "task-1", Some(json!({"v": 1})))
            .await
            .unwrap();
        let item = coordinator
            .record_local_mutation(Operation::Delete, "task-1", None)
            .await
            .unwrap();

        assert!(item.payload.is_none());
        let record = coordinator.db.get_task("task-1").unwrap().unwrap();
        assert!(record.payload.is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_task_fails() {
        let coordinator = test_coordinator();
        let result = coordinator
            .record_local_mutation(Operation::Update, "ghost", Some(json!({})))
            .await;
        assert!(matches!(result, Err(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn test_automatic_trigger_rejected_in_backoff() {
        let coordinator = test_coordinator();
        coordinator
            .login(test_credentials(), "passphrase")
            .await
            .unwrap();

        {
            let mut config = coordinator.config.write().await;
            config.next_retry_at = Some(Utc::now() + Duration::seconds(300));
        }

        let result = coordinator.request_sync(SyncTrigger::Interval).await;
        match result {
            SyncResult::Error { message, retryable } => {
                assert!(retryable);
                assert!(message.contains("backing off"));
            }
            other => panic!("Expected backoff error, got {:?}", other),
        }

        // No network was touched, so the failure counter is unchanged
        assert_eq!(coordinator.get_config().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_backoff_delay_grows_and_caps() {
        let coordinator = test_coordinator();

        let mut last_delay = 0i64;
        for _ in 0..10 {
            let before = Utc::now();
            let _ = coordinator
                .fail(SyncTrigger::Manual, Instant::now(), "boom", true, 0, 0, 0)
                .await;
            let config = coordinator.get_config().await;
            let delay = (config.next_retry_at.unwrap() - before).num_seconds();
            assert!(delay >= last_delay, "backoff must not shrink");
            assert!(delay <= MAX_RETRY_DELAY_SECS + 1);
            last_delay = delay;
        }

        // After ten failures the delay sits at the cap
        assert!(last_delay >= MAX_RETRY_DELAY_SECS - 1);
    }

    #[tokio::test]
    async fn test_phase_starts_idle() {
        let coordinator = test_coordinator();
        assert_eq!(coordinator.phase(), SyncPhase::Idle);

        let status = coordinator.status().await;
        assert!(!status.is_syncing);
        assert_eq!(status.pending_count, 0);
    }

    #[tokio::test]
    async fn test_status_reflects_pending_and_failures() {
        let coordinator = test_coordinator();
        coordinator
            .record_local_mutation(Operation::Create, "task-1", Some(json!({})))
            .await
            .unwrap();
        let _ = coordinator
            .fail(SyncTrigger::Manual, Instant::now(), "offline", true, 0, 0, 0)
            .await;

        let status = coordinator.status().await;
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.retry_count, 1);
        assert_eq!(status.error.as_deref(), Some("offline"));
        assert!(status.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let coordinator = test_coordinator();
        let mut events = coordinator.subscribe();

        let _ = coordinator.request_sync(SyncTrigger::Manual).await;

        // At minimum: CycleStarted, then phase changes, then CycleFinished
        let first = events.recv().await.unwrap();
        assert!(matches!(first, SyncEvent::CycleStarted { .. }));

        let mut saw_finished = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::CycleFinished { .. }) {
                saw_finished = true;
            }
        }
        assert!(saw_finished);
    }

    #[tokio::test]
    async fn test_resolve_conflict_keep_local_reenqueues() {
        let coordinator = test_coordinator();
        let device_id = coordinator.get_config().await.device_id;

        coordinator
            .record_local_mutation(Operation::Create, "task-1", Some(json!({"title": "Mine"})))
            .await
            .unwrap();
        let local = coordinator.db.get_task("task-1").unwrap().unwrap();

        let remote = TaskRecord {
            id: "task-1".to_string(),
            payload: Some(json!({"title": "Theirs"})),
            vector_clock: VectorClock::new().incremented("device-remote"),
            device_id: "device-remote".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let conflict = ConflictInfo {
            task_id: "task-1".to_string(),
            local: local.clone(),
            remote: remote.clone(),
            detail: "test".to_string(),
        };

        let queue_before = coordinator.queue().len().unwrap();
        coordinator
            .resolve_conflict(&conflict, ConflictChoice::KeepLocal)
            .await
            .unwrap();

        let record = coordinator.db.get_task("task-1").unwrap().unwrap();
        assert_eq!(record.payload, Some(json!({"title": "Mine"})));
        // Kept record dominates both originals
        assert_eq!(record.vector_clock.get("device-remote"), 1);
        assert_eq!(record.vector_clock.get(&device_id), 2);
        assert_eq!(coordinator.queue().len().unwrap(), queue_before + 1);
    }

    #[tokio::test]
    async fn test_resolve_conflict_accept_remote_overwrites() {
        let coordinator = test_coordinator();

        coordinator
            .record_local_mutation(Operation::Create, "task-1", Some(json!({"title": "Mine"})))
            .await
            .unwrap();
        let local = coordinator.db.get_task("task-1").unwrap().unwrap();

        let remote = TaskRecord {
            id: "task-1".to_string(),
            payload: Some(json!({"title": "Theirs"})),
            vector_clock: VectorClock::new().incremented("device-remote"),
            device_id: "device-remote".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let conflict = ConflictInfo {
            task_id: "task-1".to_string(),
            local,
            remote,
            detail: "test".to_string(),
        };

        coordinator
            .resolve_conflict(&conflict, ConflictChoice::AcceptRemote)
            .await
            .unwrap();

        let record = coordinator.db.get_task("task-1").unwrap().unwrap();
        assert_eq!(record.payload, Some(json!({"title": "Theirs"})));
        // Merged clock keeps the local counter too
        assert!(record.vector_clock.get("device-remote") >= 1);
    }

    #[test]
    fn test_parse_salt_rejects_garbage() {
        assert!(parse_salt("not-hex").is_err());
        assert!(parse_salt("abcd").is_err()); // wrong length
        let valid = hex::encode([0u8; SALT_LEN]);
        assert!(parse_salt(&valid).is_ok());
    }
}
