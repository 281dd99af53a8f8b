use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::WebhookError;
use crate::store::Database;
use log::{debug, error, info};

/// Outbound delivery seam, mockable in tests. Success is the HTTP status.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, url: &str, payload: &Value) -> Result<u16, WebhookError>;
}

/// Production transport: JSON POST with a 5 second timeout.
pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    pub fn new() -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(HttpWebhookTransport { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn post(&self, url: &str, payload: &Value) -> Result<u16, WebhookError> {
        let response = self.client.post(url).json(payload).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Per-subscription outcome of one dispatch attempt. At-least-once with
/// reporting is the delivery contract; there are no retries here.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookDelivery {
    pub webhook_id: i64,
    pub name: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

pub struct WebhookDispatcher {
    db: Database,
    transport: Arc<dyn WebhookTransport>,
}

impl WebhookDispatcher {
    pub fn new(db: Database, transport: Arc<dyn WebhookTransport>) -> Self {
        WebhookDispatcher { db, transport }
    }

    /// Deliver `data` to every active subscription matching `event`. One
    /// subscription's failure never blocks another's delivery, and
    /// `last_triggered` advances after every attempt regardless of outcome.
    pub async fn trigger_webhooks(&self, event: &str, data: Value) -> Vec<WebhookDelivery> {
        let webhooks = match self.db.webhooks_for_event(event).await {
            Ok(webhooks) => webhooks,
            Err(e) => {
                error!("Error loading webhooks for event {}: {}", event, e);
                return Vec::new();
            }
        };

        if webhooks.is_empty() {
            debug!("No webhooks found for event {}", event);
            return Vec::new();
        }

        let payload = json!({
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });

        let mut results = Vec::with_capacity(webhooks.len());
        for webhook in webhooks {
            let delivery = match self.transport.post(&webhook.url, &payload).await {
                Ok(status) => {
                    let success = (200..300).contains(&status);
                    if success {
                        info!("Webhook {} delivered ({})", webhook.name, status);
                    } else {
                        error!("Webhook {} returned status {}", webhook.name, status);
                    }
                    WebhookDelivery {
                        webhook_id: webhook.id,
                        name: webhook.name.clone(),
                        success,
                        status_code: Some(status),
                        error: None,
                    }
                }
                Err(e) => {
                    error!("Error calling webhook {}: {}", webhook.name, e);
                    WebhookDelivery {
                        webhook_id: webhook.id,
                        name: webhook.name.clone(),
                        success: false,
                        status_code: None,
                        error: Some(e.to_string()),
                    }
                }
            };

            // Attempted is what last_triggered records, not delivered
            if let Err(e) = self.db.touch_webhook(webhook.id).await {
                error!("Cannot update last_triggered for {}: {}", webhook.name, e);
            }

            results.push(delivery);
        }

        results
    }
}
