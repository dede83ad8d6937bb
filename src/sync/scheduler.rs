//! Background Sync Manager
//!
//! Triggers sync cycles without user involvement:
//! - on a fixed interval
//! - when the application regains focus
//! - when the network comes back online
//! - after a debounced delay following the most recent local edit
//!
//! All triggers funnel through the coordinator's single-flight guard, so
//! overlapping triggers never produce overlapping network cycles. A
//! minimum spacing between trigger-induced cycles prevents tight loops
//! under flapping connectivity.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::db::Database;
use crate::sync::coordinator::SyncCoordinator;
use crate::sync::models::SyncTrigger;

/// Settings key for the persisted scheduler config
const SCHEDULER_CONFIG_KEY: &str = "scheduler_config";

/// Scheduler configuration stored in the settings table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Fixed trigger interval
    pub interval_secs: u64,
    /// Quiet period after the last local edit before triggering
    pub debounce_ms: u64,
    /// Minimum spacing between trigger-induced cycles
    pub min_spacing_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 1800,
            debounce_ms: 3000,
            min_spacing_secs: 30,
        }
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

/// Background trigger manager for automatic sync cycles
pub struct BackgroundSyncManager {
    coordinator: Arc<SyncCoordinator>,
    db: Arc<Database>,
    config: Arc<tokio::sync::RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: StdMutex<Option<JoinHandle<()>>>,
    /// Instant of the last trigger-induced cycle (spacing guard)
    last_trigger_at: Arc<StdMutex<Option<Instant>>>,
    /// Bumped on every local edit; the debounce task fires only if no
    /// newer edit arrived while it slept
    edit_generation: Arc<AtomicU64>,
}

impl BackgroundSyncManager {
    /// Create a manager over the coordinator and shared database.
    pub fn new(coordinator: Arc<SyncCoordinator>, db: Arc<Database>) -> Self {
        Self {
            coordinator,
            db,
            config: Arc::new(tokio::sync::RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: StdMutex::new(None),
            last_trigger_at: Arc::new(StdMutex::new(None)),
            edit_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Load configuration from the settings table.
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self
            .db
            .get_setting(SCHEDULER_CONFIG_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to the settings table.
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(SCHEDULER_CONFIG_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Get current configuration.
    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration, persisting it and restarting the interval
    /// loop if it was running.
    pub async fn update_config(&self, new_config: SchedulerConfig) -> Result<(), SchedulerError> {
        validate_interval(new_config.interval_secs)?;

        {
            let mut config = self.config.write().await;
            *config = new_config.clone();
        }
        self.save_config().await?;

        let was_running = self.is_running();
        if was_running {
            let _ = self.stop();
        }
        if new_config.enabled {
            self.start().await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={}s",
            new_config.enabled,
            new_config.interval_secs
        );
        Ok(())
    }

    /// Start the fixed-interval trigger loop.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let interval_secs = self.config.read().await.interval_secs;
        validate_interval(interval_secs)?;

        self.running.store(true, Ordering::Relaxed);

        let running = self.running.clone();
        let coordinator = self.coordinator.clone();
        let config = self.config.clone();
        let last_trigger_at = self.last_trigger_at.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            // The first tick completes immediately; skip it so the loop
            // waits a full interval before its first trigger
            ticker.tick().await;

            log::info!("Background sync loop started (interval: {}s)", interval_secs);

            loop {
                ticker.tick().await;

                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if !coordinator.is_enabled().await {
                    log::debug!("Skipping scheduled sync: sync disabled");
                    continue;
                }

                let min_spacing = Duration::from_secs(config.read().await.min_spacing_secs);
                if !Self::claim_trigger_slot(&last_trigger_at, min_spacing) {
                    log::debug!("Skipping scheduled sync: inside minimum spacing window");
                    continue;
                }

                match coordinator.request_sync(SyncTrigger::Interval).await {
                    result if result.is_success() => {
                        log::info!("Scheduled sync completed");
                    }
                    result => {
                        log::warn!("Scheduled sync did not succeed: {:?}", result);
                    }
                }
            }

            log::info!("Background sync loop exited");
        });

        *self.task_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the interval loop.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::NotRunning);
        }

        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.task_handle.lock().unwrap().take() {
            handle.abort();
        }

        log::info!("Background sync loop stopped");
        Ok(())
    }

    /// Whether the interval loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Event Triggers
    // ========================================================================

    /// The application regained focus. Returns whether a cycle was
    /// actually spawned (spacing guard may suppress it).
    pub async fn notify_app_focus(&self) -> bool {
        self.spaced_trigger(SyncTrigger::AppFocus).await
    }

    /// The network came back online.
    pub async fn notify_network_online(&self) -> bool {
        self.spaced_trigger(SyncTrigger::NetworkOnline).await
    }

    /// A local edit happened. The trigger fires only after the edit
    /// burst has been quiet for the configured debounce window.
    pub async fn notify_local_edit(&self) {
        let generation = self.edit_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let debounce = Duration::from_millis(self.config.read().await.debounce_ms);

        let edit_generation = self.edit_generation.clone();
        let coordinator = self.coordinator.clone();
        let config = self.config.clone();
        let last_trigger_at = self.last_trigger_at.clone();

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            // A newer edit superseded this one; its own task will fire
            if edit_generation.load(Ordering::SeqCst) != generation {
                return;
            }

            let min_spacing = Duration::from_secs(config.read().await.min_spacing_secs);
            if !Self::claim_trigger_slot(&last_trigger_at, min_spacing) {
                log::debug!("Debounced edit sync suppressed by spacing window");
                return;
            }

            log::debug!("Debounced local edit triggering sync");
            let _ = coordinator.request_sync(SyncTrigger::LocalEdit).await;
        });
    }

    /// Fire a trigger unless it falls inside the spacing window.
    ///
    /// The cycle itself runs on a spawned task; overlap with an already
    /// running cycle is collapsed by the coordinator's single-flight
    /// guard.
    async fn spaced_trigger(&self, trigger: SyncTrigger) -> bool {
        let min_spacing = Duration::from_secs(self.config.read().await.min_spacing_secs);
        if !Self::claim_trigger_slot(&self.last_trigger_at, min_spacing) {
            log::debug!("{} trigger suppressed by spacing window", trigger);
            return false;
        }

        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            let _ = coordinator.request_sync(trigger).await;
        });
        true
    }

    /// Atomically check the spacing window and claim the slot.
    fn claim_trigger_slot(
        last_trigger_at: &StdMutex<Option<Instant>>,
        min_spacing: Duration,
    ) -> bool {
        let mut guard = last_trigger_at.lock().unwrap();
        if let Some(last) = *guard {
            if last.elapsed() < min_spacing {
                return false;
            }
        }
        *guard = Some(Instant::now());
        true
    }
}

impl Drop for BackgroundSyncManager {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn validate_interval(interval_secs: u64) -> Result<(), SchedulerError> {
    if interval_secs < 1 || interval_secs > 86_400 {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be 1-86400 seconds, got {}",
            interval_secs
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::SyncEvent;

    fn test_manager() -> (Arc<SyncCoordinator>, BackgroundSyncManager) {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        let coordinator = SyncCoordinator::new(db.clone()).expect("coordinator");
        let manager = BackgroundSyncManager::new(coordinator.clone(), db);
        (coordinator, manager)
    }

    /// Count CycleStarted events until the stream goes quiet.
    async fn count_cycles(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> usize {
        let mut count = 0;
        loop {
            match tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
                Ok(Ok(SyncEvent::CycleStarted { .. })) => count += 1,
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        count
    }

    #[tokio::test]
    async fn test_manager_starts_stopped() {
        let (_, manager) = test_manager();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_config_defaults() {
        let (_, manager) = test_manager();
        let config = manager.get_config().await;
        assert!(!config.enabled);
        assert_eq!(config.interval_secs, 1800);
        assert_eq!(config.debounce_ms, 3000);
        assert_eq!(config.min_spacing_secs, 30);
    }

    #[tokio::test]
    async fn test_save_load_config_roundtrip() {
        let (_, manager) = test_manager();

        {
            let mut config = manager.config.write().await;
            config.enabled = true;
            config.interval_secs = 600;
            config.min_spacing_secs = 10;
        }
        manager.save_config().await.unwrap();

        // Clobber in-memory state, then reload from the settings table
        {
            let mut config = manager.config.write().await;
            *config = SchedulerConfig::default();
        }
        manager.load_config().await.unwrap();

        let config = manager.get_config().await;
        assert!(config.enabled);
        assert_eq!(config.interval_secs, 600);
        assert_eq!(config.min_spacing_secs, 10);
    }

    #[tokio::test]
    async fn test_invalid_interval_rejected() {
        let (_, manager) = test_manager();

        let mut config = manager.get_config().await;
        config.enabled = true;
        config.interval_secs = 0;
        let result = manager.update_config(config).await;
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));

        let mut config = manager.get_config().await;
        config.enabled = true;
        config.interval_secs = 100_000;
        let result = manager.update_config(config).await;
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (_, manager) = test_manager();

        manager.start().await.unwrap();
        assert!(manager.is_running());
        assert!(matches!(
            manager.start().await,
            Err(SchedulerError::AlreadyRunning)
        ));

        manager.stop().unwrap();
        assert!(!manager.is_running());
        assert!(matches!(manager.stop(), Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_focus_trigger_fires_once_within_spacing() {
        let (coordinator, manager) = test_manager();
        let mut events = coordinator.subscribe();

        // First trigger claims the slot, second is suppressed
        assert!(manager.notify_app_focus().await);
        assert!(!manager.notify_app_focus().await);
        assert!(!manager.notify_network_online().await);

        let cycles = count_cycles(&mut events).await;
        assert_eq!(cycles, 1);
    }

    #[tokio::test]
    async fn test_spacing_window_reopens() {
        let (_, manager) = test_manager();
        {
            let mut config = manager.config.write().await;
            config.min_spacing_secs = 0;
        }

        assert!(manager.notify_app_focus().await);
        assert!(manager.notify_network_online().await);
    }

    #[tokio::test]
    async fn test_edit_burst_debounces_to_one_cycle() {
        let (coordinator, manager) = test_manager();
        {
            let mut config = manager.config.write().await;
            config.debounce_ms = 100;
            config.min_spacing_secs = 0;
        }
        let mut events = coordinator.subscribe();

        // A burst of edits inside the debounce window
        for _ in 0..5 {
            manager.notify_local_edit().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Wait out the debounce plus the cycle itself
        tokio::time::sleep(Duration::from_millis(300)).await;

        let cycles = count_cycles(&mut events).await;
        assert_eq!(cycles, 1);
    }

    #[tokio::test]
    async fn test_quiet_edits_each_trigger() {
        let (coordinator, manager) = test_manager();
        {
            let mut config = manager.config.write().await;
            config.debounce_ms = 20;
            config.min_spacing_secs = 0;
        }
        let mut events = coordinator.subscribe();

        manager.notify_local_edit().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.notify_local_edit().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cycles = count_cycles(&mut events).await;
        assert_eq!(cycles, 2);
    }
}
