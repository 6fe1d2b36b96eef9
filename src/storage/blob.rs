//! Blob store adapter for time-limited signed media URLs.
//!
//! The object store itself is external; the dispatcher only asks it to
//! mint signed URLs that are embedded in outgoing mail.

use crate::errors::DeliveryError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Mint a time-limited signed URL for one stored object.
    async fn create_signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl_seconds: u64,
    ) -> Result<String, DeliveryError>;
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    url: String,
}

/// HTTP-backed signed URL client.
pub struct HttpBlobStore {
    client: reqwest::Client,
    api_url: String,
    timeout: Duration,
}

impl HttpBlobStore {
    pub fn new(client: reqwest::Client, api_url: String, timeout: Duration) -> Self {
        Self {
            client,
            api_url,
            timeout,
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn create_signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl_seconds: u64,
    ) -> Result<String, DeliveryError> {
        let response = self
            .client
            .post(format!("{}/signed-url", self.api_url))
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "bucket": bucket,
                "path": path,
                "expires_in": ttl_seconds,
            }))
            .send()
            .await
            .map_err(|e| DeliveryError::MediaResolve {
                media_id: path.to_string(),
                details: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(DeliveryError::MediaResolve {
                media_id: path.to_string(),
                details: format!("signing endpoint returned {}", response.status()),
            });
        }

        let body: SignedUrlResponse =
            response
                .json()
                .await
                .map_err(|e| DeliveryError::MediaResolve {
                    media_id: path.to_string(),
                    details: e.to_string(),
                })?;
        Ok(body.url)
    }
}

/// In-memory implementation for testing; returns deterministic URLs.
#[derive(Default)]
pub struct MemoryBlobStore {
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn create_signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl_seconds: u64,
    ) -> Result<String, DeliveryError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DeliveryError::MediaResolve {
                media_id: path.to_string(),
                details: "injected failure".to_string(),
            });
        }
        Ok(format!(
            "https://blob.test/{}/{}?expires={}",
            bucket, path, ttl_seconds
        ))
    }
}
