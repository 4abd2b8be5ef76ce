use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Append-only record of a single delivery attempt.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: String,
    pub notification_id: String,
    pub attempt_number: i32,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeliveryAttempt {
    pub notification_id: String,
    pub attempt_number: i32,
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}
