//! Webhook notification system
//! Pushes inspection summaries to the receivers a schedule names

use crate::db::{self, Database};
use crate::inspection::summary;
use async_trait::async_trait;
use kubepatrol_common::{Error, Result, WebhookLogRecord, WebhookReceiver};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// What came back from one delivery attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status_code: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Delivers one message to one receiver
#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// `Err` means no response was obtained (connect failure, timeout)
    async fn send(&self, receiver: &WebhookReceiver, title: &str, text: &str) -> Result<WebhookResponse>;
}

/// Request body for a receiver platform
pub fn platform_body(platform: &str, title: &str, text: &str) -> serde_json::Value {
    let content = if title.is_empty() {
        text.to_string()
    } else {
        format!("{}\n{}", title, text)
    };

    match platform.to_ascii_lowercase().as_str() {
        "feishu" | "lark" => json!({
            "msg_type": "text",
            "content": { "text": content },
        }),
        "dingtalk" | "wechat" | "wecom" => json!({
            "msgtype": "text",
            "text": { "content": content },
        }),
        _ => json!({
            "title": title,
            "text": text,
            "source": "kubepatrol",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    }
}

/// `WebhookSender` over HTTP POST
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::System(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, receiver: &WebhookReceiver, title: &str, text: &str) -> Result<WebhookResponse> {
        let body = platform_body(&receiver.platform, title, text);

        let response = self
            .client
            .post(&receiver.target_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::System(format!("Webhook request to {} failed: {}", receiver.name, e)))?;

        let status_code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(WebhookResponse { status_code, body })
    }
}

/// Resolves receivers for a run and logs every delivery
pub struct WebhookDispatcher {
    db: Database,
    sender: Arc<dyn WebhookSender>,
}

impl WebhookDispatcher {
    pub fn new(db: Database, sender: Arc<dyn WebhookSender>) -> Self {
        Self { db, sender }
    }

    /// Send the run's summary to every receiver of its schedule. Each
    /// receiver is delivered to and logged independently.
    pub async fn push_by_record_id(&self, record_id: i64) -> Result<Vec<WebhookLogRecord>> {
        let record = db::records::get(self.db.pool(), record_id).await?;
        let schedule = db::schedules::get(self.db.pool(), record.schedule_id).await?;

        let receivers = db::webhooks::get_receivers(self.db.pool(), &schedule.webhook_ids()).await?;
        if receivers.is_empty() {
            tracing::debug!(record_id, "No webhook receivers configured");
            return Ok(Vec::new());
        }

        let text = match record.summary {
            Some(ref text) if !text.is_empty() => text.clone(),
            _ => summary::generate(&self.db, record_id).await?,
        };
        let title = format!("Inspection report: {}", record.schedule_name);

        let deliveries = receivers
            .iter()
            .map(|receiver| self.deliver(receiver, record_id, &title, &text));
        let logs = futures::future::join_all(deliveries).await;

        tracing::info!(record_id, receivers = logs.len(), "Webhook notifications sent");
        Ok(logs)
    }

    /// Send a fixed test message to one receiver. Not logged.
    pub async fn push_test(&self, receiver_id: i64) -> Result<WebhookResponse> {
        let receiver = db::webhooks::get_receiver(self.db.pool(), receiver_id).await?;
        self.sender.send(&receiver, "kubepatrol", "test").await
    }

    async fn deliver(&self, receiver: &WebhookReceiver, record_id: i64, title: &str, text: &str) -> WebhookLogRecord {
        let mut log = WebhookLogRecord {
            id: 0,
            receiver_id: receiver.id,
            record_id,
            status_code: None,
            response_body: String::new(),
            error: None,
            created_at: chrono::Utc::now().timestamp(),
        };

        match self.sender.send(receiver, title, text).await {
            Ok(response) => {
                if !response.is_success() {
                    log.error = Some(format!("Webhook returned error status: {}", response.status_code));
                    tracing::warn!(receiver = %receiver.name, status = response.status_code, "Webhook rejected");
                }
                log.status_code = Some(i64::from(response.status_code));
                log.response_body = response.body;
            }
            Err(e) => {
                tracing::error!(receiver = %receiver.name, "Webhook delivery failed: {}", e);
                log.error = Some(e.to_string());
            }
        }

        match db::webhooks::insert_log(self.db.pool(), &log).await {
            Ok(id) => log.id = id,
            Err(e) => tracing::warn!(record_id, "Failed to record webhook delivery: {}", e),
        }
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_bodies() {
        let feishu = platform_body("feishu", "t", "body");
        assert_eq!(feishu["msg_type"], "text");
        assert_eq!(feishu["content"]["text"], "t\nbody");

        let dingtalk = platform_body("DingTalk", "", "body");
        assert_eq!(dingtalk["msgtype"], "text");
        assert_eq!(dingtalk["text"]["content"], "body");

        let generic = platform_body("slack", "t", "body");
        assert_eq!(generic["title"], "t");
        assert_eq!(generic["text"], "body");
    }

    #[test]
    fn test_response_success_range() {
        let ok = WebhookResponse {
            status_code: 204,
            body: String::new(),
        };
        let rejected = WebhookResponse {
            status_code: 400,
            body: "bad".to_string(),
        };
        assert!(ok.is_success());
        assert!(!rejected.is_success());
    }
}
