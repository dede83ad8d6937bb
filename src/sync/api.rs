//! Sync API Client - HTTP communication with the sync server
//!
//! Handles all REST API calls to the sync server:
//! - Pushing encrypted operations
//! - Pulling remote changes
//! - Token refresh
//! - Device management
//!
//! The server only ever sees ciphertext; every payload field in these
//! requests is encrypted before it reaches this module.

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::sync::clock::VectorClock;
use crate::sync::models::Operation;

const DEFAULT_BASE_URL: &str = "https://sync.tasksync.app/api/v1";

/// Request timeout for every remote call
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// API client for the sync server
pub struct SyncApiClient {
    client: Client,
    base_url: String,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl SyncApiClient {
    /// Create a client against the production endpoint.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Create a client against a specific base URL (tests point this at a
    /// mock server).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.into(),
            access_token: Arc::new(RwLock::new(None)),
        }
    }

    /// Set the bearer token (after login or refresh)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    /// Get the cached bearer token
    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear the bearer token (logout)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    /// Exchange the refresh credential for a new bearer token.
    ///
    /// The new token is cached on success.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<AuthResponse, SyncApiError> {
        let req = RefreshRequest {
            refresh_token: refresh_token.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/auth/refresh", self.base_url))
            .json(&req)
            .send()
            .await?;

        let auth: AuthResponse = handle_response(response).await?;
        self.set_token(auth.access_token.clone()).await;
        Ok(auth)
    }

    /// Push a batch of encrypted operations.
    pub async fn push(&self, req: &PushRequest) -> Result<PushResponse, SyncApiError> {
        let token = self.get_token().await.ok_or(SyncApiError::Unauthorized)?;

        let response = self
            .client
            .post(format!("{}/sync/push", self.base_url))
            .bearer_auth(token)
            .json(req)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Pull remote changes since the given clock/timestamp.
    pub async fn pull(&self, req: &PullRequest) -> Result<PullResponse, SyncApiError> {
        let token = self.get_token().await.ok_or(SyncApiError::Unauthorized)?;

        let response = self
            .client
            .post(format!("{}/sync/pull", self.base_url))
            .bearer_auth(token)
            .json(req)
            .send()
            .await?;

        handle_response(response).await
    }

    /// List all devices registered to this account.
    pub async fn list_devices(&self) -> Result<Vec<DeviceResponse>, SyncApiError> {
        let token = self.get_token().await.ok_or(SyncApiError::Unauthorized)?;

        let response = self
            .client
            .get(format!("{}/devices", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Revoke a device's access.
    pub async fn revoke_device(&self, device_id: &str) -> Result<(), SyncApiError> {
        let token = self.get_token().await.ok_or(SyncApiError::Unauthorized)?;

        let response = self
            .client
            .delete(format!("{}/devices/{}", self.base_url, device_id))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }
}

impl Default for SyncApiClient {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Relative lifetime in seconds
    pub expires_in: i64,
}

impl AuthResponse {
    /// Convert the relative lifetime into the canonical absolute expiry
    /// (seconds since epoch). Done here, at the boundary, so nothing
    /// downstream has to guess units.
    pub fn expires_at(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() + self.expires_in
    }
}

/// One encrypted mutation on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedOperation {
    /// Queue item id, echoed back in rejections
    pub id: String,
    pub operation: Operation,
    pub task_id: String,

    /// Base64 of gzip-compressed ciphertext; absent for deletes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,

    /// Base64 nonce; absent for deletes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    pub vector_clock: VectorClock,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub device_id: String,
    pub operations: Vec<EncryptedOperation>,
    pub vector_clock: VectorClock,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedOperation {
    /// Queue item id of the rejected operation
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub accepted_count: usize,
    #[serde(default)]
    pub rejected: Vec<RejectedOperation>,
    pub server_vector_clock: VectorClock,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub device_id: String,
    pub last_vector_clock: VectorClock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_timestamp: Option<DateTime<Utc>>,
    pub limit: u32,
}

/// One encrypted task record coming back from the server
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTask {
    pub task_id: String,
    /// Device that authored the last mutation (LWW tie-break key)
    pub device_id: String,

    /// Base64 of gzip-compressed ciphertext; absent for tombstones
    #[serde(default)]
    pub ciphertext: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,

    pub vector_clock: VectorClock,

    /// Tombstone marker for deletes
    #[serde(default)]
    pub deleted: bool,

    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub tasks: Vec<RemoteTask>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub device_id: String,
    pub device_name: String,
    pub last_seen_at: String,
    pub created_at: String,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    /// Transport failure (DNS, connect, timeout)
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - token invalid or expired")]
    Unauthorized,

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response from server")]
    InvalidResponse,
}

impl SyncApiError {
    /// Whether the coordinator should retry this failure with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncApiError::Request(_) => true,
            SyncApiError::ServerError(_) => true,
            SyncApiError::NetworkError(_) => true,
            SyncApiError::RateLimited => true,
            SyncApiError::Unauthorized => false,
            SyncApiError::QuotaExceeded(_) => false,
            SyncApiError::InvalidResponse => false,
        }
    }
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|_| SyncApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert an error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED => SyncApiError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => SyncApiError::RateLimited,
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "quota exceeded".to_string());
            SyncApiError::QuotaExceeded(msg)
        }
        s if s.is_server_error() => {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::ServerError(msg)
        }
        _ => {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::NetworkError(format!("{}: {}", status, msg))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
