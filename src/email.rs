//! Outbound email channel.
//!
//! The provider queues and rate-limits on its side, so the dispatcher
//! issues sends without client-side throttling. Each send carries an
//! explicit timeout so a slow provider cannot stall the cycle.

use crate::errors::DeliveryError;
use crate::render::RenderedMessage;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Provider acknowledgement for one send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub success: bool,
    pub id: Option<String>,
}

#[async_trait]
pub trait EmailChannel: Send + Sync {
    async fn send(&self, to: &str, message: &RenderedMessage) -> Result<SendReceipt, DeliveryError>;
}

#[derive(Deserialize)]
struct EmailApiResponse {
    #[serde(default)]
    id: Option<String>,
}

/// HTTP email API client.
pub struct HttpEmailChannel {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from_address: String,
    timeout: Duration,
}

impl HttpEmailChannel {
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        api_key: String,
        from_address: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_url,
            api_key,
            from_address,
            timeout,
        }
    }
}

#[async_trait]
impl EmailChannel for HttpEmailChannel {
    async fn send(
        &self,
        to: &str,
        message: &RenderedMessage,
    ) -> Result<SendReceipt, DeliveryError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "from": self.from_address,
                "to": to,
                "subject": message.subject,
                "html": message.html_body,
                "text": message.text_body,
            }))
            .send()
            .await
            .map_err(|e| DeliveryError::EmailDispatch {
                to: to.to_string(),
                details: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::EmailDispatch {
                to: to.to_string(),
                details: format!("provider returned {}: {}", status, body),
            });
        }

        let body: EmailApiResponse = response.json().await.unwrap_or(EmailApiResponse { id: None });
        debug!(to = %to, id = ?body.id, "Email accepted by provider");
        Ok(SendReceipt {
            success: true,
            id: body.id,
        })
    }
}

/// Recording implementation for testing.
///
/// Captures every accepted send and can be told to fail specific
/// addresses to exercise partial-failure paths.
#[derive(Default)]
pub struct RecordingEmailChannel {
    sent: Mutex<Vec<(String, RenderedMessage)>>,
    fail_addresses: Mutex<Vec<String>>,
}

impl RecordingEmailChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_address(&self, address: &str) {
        self.fail_addresses.lock().await.push(address.to_string());
    }

    pub async fn clear_failures(&self) {
        self.fail_addresses.lock().await.clear();
    }

    pub async fn sent(&self) -> Vec<(String, RenderedMessage)> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, address: &str) -> usize {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(to, _)| to == address)
            .count()
    }
}

#[async_trait]
impl EmailChannel for RecordingEmailChannel {
    async fn send(
        &self,
        to: &str,
        message: &RenderedMessage,
    ) -> Result<SendReceipt, DeliveryError> {
        if self.fail_addresses.lock().await.iter().any(|a| a == to) {
            return Err(DeliveryError::EmailDispatch {
                to: to.to_string(),
                details: "injected failure".to_string(),
            });
        }
        self.sent
            .lock()
            .await
            .push((to.to_string(), message.clone()));
        Ok(SendReceipt {
            success: true,
            id: Some(format!("test-{}", uuid::Uuid::new_v4())),
        })
    }
}
