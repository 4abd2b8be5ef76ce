use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Delivery state of a scheduled notification.
///
/// `Processing` is held only while a worker owns the row between claim and
/// outcome; `Sent`, `Cancelled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Cancelled,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Cancelled => "cancelled",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent | NotificationStatus::Cancelled | NotificationStatus::Failed
        )
    }
}

/// A notification produced by a rule and waiting for (or done with) delivery.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduledNotification {
    /// Primary key (UUID)
    pub id: String,

    pub rule_id: String,

    pub user_id: String,

    pub session_id: Option<String>,

    pub campaign_id: Option<String>,

    /// Delivery time computed at creation. Never updated afterwards.
    pub scheduled_for: DateTime<Utc>,

    pub status: NotificationStatus,

    /// Number of failed delivery attempts so far.
    pub retry_count: i32,

    /// When the next retry becomes due. Only meaningful while pending with
    /// `retry_count > 0`.
    pub next_retry: Option<DateTime<Utc>>,

    /// Last error observed when an attempt failed (if any).
    pub last_error: Option<String>,

    /// JSON-serialized [`NotificationMetadata`].
    pub metadata_json: String,

    /// Set when a worker claims the row for delivery.
    pub claimed_at: Option<DateTime<Utc>>,

    pub sent_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ScheduledNotification {
    /// Parsed metadata. A corrupt payload yields empty metadata rather than
    /// blocking delivery.
    pub fn metadata(&self) -> NotificationMetadata {
        serde_json::from_str(&self.metadata_json).unwrap_or_else(|e| {
            tracing::warn!(
                "Notification {} has unreadable metadata ({}); using defaults",
                self.id,
                e
            );
            NotificationMetadata::default()
        })
    }

    /// The instant at which this row becomes eligible for its next attempt.
    pub fn due_at(&self) -> DateTime<Utc> {
        if self.retry_count > 0 {
            self.next_retry.unwrap_or(self.scheduled_for)
        } else {
            self.scheduled_for
        }
    }
}

/// Extra context carried alongside a scheduled notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    /// Set when this notification was requeued from a dead-letter entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeued_from: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub additional_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_history: Vec<RetryHistoryEntry>,
}

/// One failed delivery attempt, kept in metadata and copied to the dead-letter row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryHistoryEntry {
    pub attempt: i32,
    pub attempted_at: DateTime<Utc>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retryable: bool,
}

/// Data required to persist a new scheduled notification. New rows always
/// start as `pending` with `retry_count = 0`.
#[derive(Debug, Clone)]
pub struct CreateScheduledNotification {
    pub rule_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub campaign_id: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub metadata: NotificationMetadata,
}

/// Selects pending notifications to cancel. `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct CancelFilter {
    pub user_id: String,
    pub session_id: Option<String>,
    pub campaign_id: Option<String>,
    pub rule_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!NotificationStatus::Pending.is_terminal());
        assert!(!NotificationStatus::Processing.is_terminal());
        assert!(NotificationStatus::Sent.is_terminal());
        assert!(NotificationStatus::Cancelled.is_terminal());
        assert!(NotificationStatus::Failed.is_terminal());
    }

    #[test]
    fn metadata_serializes_camel_case_and_skips_empty() {
        let meta = NotificationMetadata {
            trigger: Some("session_complete".to_string()),
            template_id: Some("tpl".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["trigger"], "session_complete");
        assert_eq!(json["templateId"], "tpl");
        assert!(json.get("retryHistory").is_none());
        assert!(json.get("additionalData").is_none());
    }
}
