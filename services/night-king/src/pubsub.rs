//! Notification channel: Pub/Sub pull subscription client.
//!
//! Provides methods for:
//! - Pulling a batch of preemption notifications
//! - Extending the ack deadline of a notification still being handled
//! - Acknowledging a notification once it has been handled
//!
//! A mock subscription is provided for testing and development.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::auth::TokenProvider;
use crate::config::Config;

/// Server-side wait for a pull before it returns empty.
const PULL_TIMEOUT: Duration = Duration::from_secs(90);

/// Longest ack deadline the service accepts.
pub const MAX_ACK_DEADLINE_SECS: u32 = 600;

/// Shortest ack deadline the service accepts.
pub const MIN_ACK_DEADLINE_SECS: u32 = 10;

/// One delivery from the notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Handle used to acknowledge this delivery.
    pub ack_id: String,

    /// Channel-assigned message ID.
    pub message_id: String,

    /// Raw payload.
    pub data: Vec<u8>,

    /// When the message was published.
    pub publish_time: Option<DateTime<Utc>>,
}

/// Source of inbound notifications.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Name of the underlying subscription, for logs.
    fn name(&self) -> &str;

    /// Wait for up to `max_messages` notifications.
    ///
    /// May return an empty batch when nothing arrived in time.
    async fn pull(&self, max_messages: u32) -> Result<Vec<Notification>>;

    /// Push the redelivery deadline of a delivery `seconds` into the future.
    async fn modify_ack_deadline(&self, ack_id: &str, seconds: u32) -> Result<()>;

    /// Acknowledge a delivery so it is not redelivered.
    async fn acknowledge(&self, ack_id: &str) -> Result<()>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: Vec<&'a str>,
    ack_deadline_seconds: u32,
}

impl From<ReceivedMessage> for Notification {
    fn from(received: ReceivedMessage) -> Self {
        let message = received.message;
        let data = match base64::engine::general_purpose::STANDARD.decode(&message.data) {
            Ok(data) => data,
            Err(e) => {
                // Hand the raw text on; the decoder will drop it.
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Message data is not valid base64"
                );
                message.data.into_bytes()
            }
        };

        Notification {
            ack_id: received.ack_id,
            message_id: message.message_id,
            data,
            publish_time: message.publish_time,
        }
    }
}

/// Pub/Sub REST client bound to one subscription.
pub struct PubSubClient {
    client: reqwest::Client,
    subscription_url: String,
    subscription_name: String,
    tokens: Arc<dyn TokenProvider>,
}

impl PubSubClient {
    /// Create a new subscription client.
    pub fn new(config: &Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build Pub/Sub HTTP client")?;

        Ok(Self {
            client,
            subscription_url: format!(
                "{}/v1/projects/{}/subscriptions/{}",
                config.pubsub_endpoint, config.project, config.subscription_name
            ),
            subscription_name: config.subscription_name.clone(),
            tokens,
        })
    }
}

#[async_trait]
impl NotificationSource for PubSubClient {
    fn name(&self) -> &str {
        &self.subscription_name
    }

    async fn pull(&self, max_messages: u32) -> Result<Vec<Notification>> {
        let url = format!("{}:pull", self.subscription_url);
        let token = self.tokens.access_token().await?;

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&PullRequest { max_messages })
            .timeout(PULL_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to pull messages");
            anyhow::bail!("Failed to pull messages: {} - {}", status, body);
        }

        let pulled: PullResponse = response.json().await?;
        debug!(
            subscription = %self.subscription_name,
            count = pulled.received_messages.len(),
            "Pulled messages"
        );

        Ok(pulled
            .received_messages
            .into_iter()
            .map(Notification::from)
            .collect())
    }

    async fn modify_ack_deadline(&self, ack_id: &str, seconds: u32) -> Result<()> {
        let url = format!("{}:modifyAckDeadline", self.subscription_url);
        let token = self.tokens.access_token().await?;

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&ModifyAckDeadlineRequest {
                ack_ids: vec![ack_id],
                ack_deadline_seconds: seconds,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to modify ack deadline: {} - {}", status, body);
        }

        Ok(())
    }

    async fn acknowledge(&self, ack_id: &str) -> Result<()> {
        let url = format!("{}:acknowledge", self.subscription_url);
        let token = self.tokens.access_token().await?;

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&AcknowledgeRequest {
                ack_ids: vec![ack_id],
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to acknowledge message");
            anyhow::bail!("Failed to acknowledge message: {} - {}", status, body);
        }

        Ok(())
    }
}

/// In-memory subscription for testing and development.
///
/// `pull` waits until at least one notification is queued.
#[derive(Default)]
pub struct MockSubscription {
    queue: Mutex<VecDeque<Notification>>,
    available: Notify,
    published: AtomicU64,
    acks: Mutex<Vec<String>>,
    extensions: Mutex<Vec<(String, u32)>>,
    fail_acks: bool,
    failing_pulls: AtomicU32,
}

impl MockSubscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a subscription whose acknowledgments fail.
    pub fn failing_acks() -> Self {
        Self {
            fail_acks: true,
            ..Self::default()
        }
    }

    /// Create a subscription whose first `count` pulls fail.
    pub fn failing_pulls(count: u32) -> Self {
        Self {
            failing_pulls: AtomicU32::new(count),
            ..Self::default()
        }
    }

    /// Queue a notification with the given payload; returns its ack ID.
    pub fn publish(&self, data: impl Into<Vec<u8>>) -> String {
        let seq = self.published.fetch_add(1, Ordering::SeqCst);
        let ack_id = format!("ack-{}", seq);
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(Notification {
                ack_id: ack_id.clone(),
                message_id: format!("msg-{}", seq),
                data: data.into(),
                publish_time: Some(Utc::now()),
            });

        self.available.notify_one();
        ack_id
    }

    /// Ack IDs acknowledged so far, in order.
    pub fn acks(&self) -> Vec<String> {
        self.acks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Ack deadline extensions so far, in order.
    pub fn extensions(&self) -> Vec<(String, u32)> {
        self.extensions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl NotificationSource for MockSubscription {
    fn name(&self) -> &str {
        "mock-subscription"
    }

    async fn pull(&self, max_messages: u32) -> Result<Vec<Notification>> {
        let failing = self
            .failing_pulls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            anyhow::bail!("[MOCK] pull configured to fail");
        }

        loop {
            {
                let mut queue = self
                    .queue
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if !queue.is_empty() {
                    let take = queue.len().min(max_messages as usize);
                    let batch: Vec<_> = queue.drain(..take).collect();
                    if !queue.is_empty() {
                        self.available.notify_one();
                    }
                    return Ok(batch);
                }
            }
            self.available.notified().await;
        }
    }

    async fn modify_ack_deadline(&self, ack_id: &str, seconds: u32) -> Result<()> {
        self.extensions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((ack_id.to_string(), seconds));
        Ok(())
    }

    async fn acknowledge(&self, ack_id: &str) -> Result<()> {
        if self.fail_acks {
            anyhow::bail!("[MOCK] acknowledge configured to fail");
        }
        self.acks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ack_id.to_string());
        Ok(())
    }
}
