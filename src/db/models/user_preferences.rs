use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: String,
    /// IANA timezone name (e.g. 'Europe/Berlin').
    pub timezone: String,
    /// Quiet hours start as `HH:MM` in the user's timezone.
    pub quiet_hours_start: Option<String>,
    /// Quiet hours end as `HH:MM` in the user's timezone.
    pub quiet_hours_end: Option<String>,
    pub frequency: String,
    pub updated_at: DateTime<Utc>,
}

impl UserPreferences {
    /// Preferences used when a user has none stored: UTC, no quiet hours.
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            timezone: "UTC".to_string(),
            quiet_hours_start: None,
            quiet_hours_end: None,
            frequency: "immediate".to_string(),
            updated_at: Utc::now(),
        }
    }

    pub fn has_quiet_hours(&self) -> bool {
        self.quiet_hours_start.is_some() && self.quiet_hours_end.is_some()
    }
}
