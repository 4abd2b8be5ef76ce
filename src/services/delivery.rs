//! Delivery channel seam and the webhook implementation used by the binary.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use url::Url;

use crate::db::{NotificationMetadata, ScheduledNotification};
use crate::error::{AppError, AppResult};

/// Result of one delivery attempt as reported by a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
        }
    }
}

/// Transport that actually hands a notification to the user. Implementations
/// enforce their own timeout and report expiry as `TIMEOUT`.
#[async_trait]
pub trait DeliveryChannel: Send + Sync + 'static {
    async fn send(&self, notification: &ScheduledNotification) -> DeliveryOutcome;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    id: &'a str,
    rule_id: &'a str,
    user_id: &'a str,
    session_id: Option<&'a str>,
    campaign_id: Option<&'a str>,
    scheduled_for: chrono::DateTime<chrono::Utc>,
    retry_count: i32,
    metadata: NotificationMetadata,
}

/// POSTs each notification as JSON to a fixed endpoint.
pub struct WebhookDeliveryChannel {
    client: reqwest::Client,
    url: Url,
}

impl WebhookDeliveryChannel {
    pub fn new(url: &str, timeout: Duration) -> AppResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| AppError::Config(format!("Invalid delivery webhook URL '{}': {}", url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl DeliveryChannel for WebhookDeliveryChannel {
    async fn send(&self, notification: &ScheduledNotification) -> DeliveryOutcome {
        let mut metadata = notification.metadata();
        // History is internal bookkeeping, not part of the delivered payload.
        metadata.retry_history.clear();
        let payload = WebhookPayload {
            id: &notification.id,
            rule_id: &notification.rule_id,
            user_id: &notification.user_id,
            session_id: notification.session_id.as_deref(),
            campaign_id: notification.campaign_id.as_deref(),
            scheduled_for: notification.scheduled_for,
            retry_count: notification.retry_count,
            metadata,
        };

        let response = match self.client.post(self.url.clone()).json(&payload).send().await {
            Ok(r) => r,
            Err(e) => return classify_transport_error(&e),
        };

        let status = response.status();
        if status.is_success() {
            return DeliveryOutcome::delivered();
        }
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(
            "Webhook rejected notification {}: {} - {}",
            notification.id,
            status,
            body
        );
        classify_status(status, &body)
    }
}

fn classify_transport_error(error: &reqwest::Error) -> DeliveryOutcome {
    if error.is_timeout() {
        DeliveryOutcome::failed("TIMEOUT", format!("Delivery timed out: {}", error))
    } else if error.is_connect() {
        DeliveryOutcome::failed("NETWORK_ERROR", format!("Connection failed: {}", error))
    } else {
        DeliveryOutcome::failed("NETWORK_ERROR", format!("Failed to send: {}", error))
    }
}

/// Map a non-success HTTP status onto a delivery error code.
fn classify_status(status: StatusCode, body: &str) -> DeliveryOutcome {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    if status == StatusCode::TOO_MANY_REQUESTS {
        DeliveryOutcome::failed("RATE_LIMITED", message)
    } else if status.is_server_error() {
        DeliveryOutcome::failed(status.as_u16().to_string(), message)
    } else {
        DeliveryOutcome::failed(format!("HTTP_{}", status.as_u16()), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let limited = classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(limited.error_code.as_deref(), Some("RATE_LIMITED"));
        assert!(!limited.success);

        let unavailable = classify_status(StatusCode::SERVICE_UNAVAILABLE, "");
        assert_eq!(unavailable.error_code.as_deref(), Some("503"));

        let forbidden = classify_status(StatusCode::FORBIDDEN, "authentication failed");
        assert_eq!(forbidden.error_code.as_deref(), Some("HTTP_403"));
        assert!(forbidden
            .error_message
            .unwrap()
            .contains("authentication failed"));
    }

    #[test]
    fn rejects_invalid_webhook_url() {
        assert!(WebhookDeliveryChannel::new("not a url", Duration::from_secs(1)).is_err());
        assert!(WebhookDeliveryChannel::new("http://localhost:9/hook", Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        // Port 9 (discard) is not expected to accept connections in test environments.
        let channel =
            WebhookDeliveryChannel::new("http://127.0.0.1:9/hook", Duration::from_secs(2)).unwrap();
        let notification = ScheduledNotification {
            id: "n1".to_string(),
            rule_id: "r1".to_string(),
            user_id: "u1".to_string(),
            session_id: None,
            campaign_id: None,
            scheduled_for: chrono::Utc::now(),
            status: crate::db::NotificationStatus::Processing,
            retry_count: 0,
            next_retry: None,
            last_error: None,
            metadata_json: "{}".to_string(),
            claimed_at: None,
            sent_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let outcome = channel.send(&notification).await;
        assert!(!outcome.success);
        assert!(matches!(
            outcome.error_code.as_deref(),
            Some("NETWORK_ERROR") | Some("TIMEOUT")
        ));
    }
}
