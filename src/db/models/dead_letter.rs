use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::scheduled_notification::{NotificationMetadata, RetryHistoryEntry};

/// Why a notification ended up in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NonRetryableError,
    MaxRetriesExceeded,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NonRetryableError => "non_retryable_error",
            FailureReason::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }
}

/// A terminally failed notification, retained as an audit trail.
///
/// Rows are never deleted; a requeue only sets `requeued*` and spawns a fresh
/// scheduled notification.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeadLetterNotification {
    pub id: String,
    pub original_notification_id: String,
    pub user_id: String,
    pub rule_id: String,
    pub template_id: Option<String>,
    pub failure_reason: FailureReason,
    pub retry_attempts: i32,
    pub last_error: Option<String>,
    /// JSON-serialized [`DeadLetterMetadata`].
    pub metadata_json: String,
    pub requeued: bool,
    pub requeued_at: Option<DateTime<Utc>>,
    pub requeued_notification_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterNotification {
    pub fn metadata(&self) -> DeadLetterMetadata {
        serde_json::from_str(&self.metadata_json).unwrap_or_default()
    }
}

/// Snapshot of the original notification plus its full retry history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMetadata {
    #[serde(default)]
    pub retry_history: Vec<RetryHistoryEntry>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub original_scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notification: NotificationMetadata,
}

#[derive(Debug, Clone)]
pub struct CreateDeadLetter {
    pub original_notification_id: String,
    pub user_id: String,
    pub rule_id: String,
    pub template_id: Option<String>,
    pub failure_reason: FailureReason,
    pub retry_attempts: i32,
    pub last_error: Option<String>,
    pub metadata: DeadLetterMetadata,
}
