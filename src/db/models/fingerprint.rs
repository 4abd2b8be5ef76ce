use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Expiring occurrence counter for a deduplication key.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationFingerprint {
    pub id: String,
    pub fingerprint_key: String,
    pub user_id: String,
    pub rule_id: Option<String>,
    pub session_id: Option<String>,
    pub campaign_id: Option<String>,
    pub content_hash: Option<String>,
    pub occurrence_count: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateFingerprint {
    pub fingerprint_key: String,
    pub user_id: String,
    pub rule_id: Option<String>,
    pub session_id: Option<String>,
    pub campaign_id: Option<String>,
    pub content_hash: Option<String>,
    pub expires_at: DateTime<Utc>,
}
