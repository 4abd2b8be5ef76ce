use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{AppError, AppResult};

/// A notification rule as stored in `notification_rules`.
///
/// Conditions and key fields are kept as JSON text; use [`NotificationRule::conditions`]
/// and [`NotificationRule::key_fields`] to get the typed forms.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: String,
    pub name: String,
    /// Trigger event this rule reacts to (e.g. 'session_complete').
    pub trigger_event: String,
    pub delay_minutes: i64,
    pub enabled: bool,
    pub priority: i64,
    pub template_id: String,
    /// JSON array of `{"type": ..., "value": ...}` objects.
    pub conditions_json: String,
    /// JSON array of key field names used for deduplication.
    pub key_fields_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRule {
    pub fn conditions(&self) -> AppResult<Vec<RuleCondition>> {
        let stored: Vec<StoredCondition> = serde_json::from_str(&self.conditions_json)?;
        stored.into_iter().map(RuleCondition::try_from).collect()
    }

    pub fn key_fields(&self) -> AppResult<Vec<KeyField>> {
        Ok(serde_json::from_str(&self.key_fields_json)?)
    }
}

#[derive(Debug, Clone)]
pub struct CreateNotificationRule {
    pub name: String,
    pub trigger_event: String,
    pub delay_minutes: i64,
    pub enabled: bool,
    pub priority: i64,
    pub template_id: String,
    pub conditions: Vec<RuleCondition>,
    pub key_fields: Vec<KeyField>,
}

/// Fields a fingerprint key can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyField {
    UserId,
    RuleId,
    SessionId,
    CampaignId,
    ContentHash,
    Trigger,
}

impl KeyField {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyField::UserId => "user_id",
            KeyField::RuleId => "rule_id",
            KeyField::SessionId => "session_id",
            KeyField::CampaignId => "campaign_id",
            KeyField::ContentHash => "content_hash",
            KeyField::Trigger => "trigger",
        }
    }
}

/// Wire shape of a condition inside `conditions_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCondition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// A typed rule condition. Every condition of a rule must hold for it to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleCondition {
    SessionType(String),
    /// Inclusive lower bound on the session duration, in seconds.
    SessionDurationMin(i64),
    /// Inclusive upper bound on the session duration, in seconds.
    SessionDurationMax(i64),
    UserRole(String),
    /// Inclusive hour range; wraps past midnight when `start_hour > end_hour`.
    TimeOfDay { start_hour: u32, end_hour: u32 },
    /// A condition kind this build does not understand.
    Unknown { kind: String },
}

impl RuleCondition {
    pub fn kind(&self) -> &str {
        match self {
            RuleCondition::SessionType(_) => "session_type",
            RuleCondition::SessionDurationMin(_) => "session_duration_min",
            RuleCondition::SessionDurationMax(_) => "session_duration_max",
            RuleCondition::UserRole(_) => "user_role",
            RuleCondition::TimeOfDay { .. } => "time_of_day",
            RuleCondition::Unknown { kind } => kind,
        }
    }
}

fn expect_string(kind: &str, value: &serde_json::Value) -> AppResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation(format!("condition '{}' expects a string", kind)))
}

fn expect_integer(kind: &str, value: &serde_json::Value) -> AppResult<i64> {
    value
        .as_i64()
        .ok_or_else(|| AppError::Validation(format!("condition '{}' expects an integer", kind)))
}

fn expect_hour(kind: &str, value: Option<&serde_json::Value>) -> AppResult<u32> {
    match value.and_then(|v| v.as_u64()) {
        Some(h) if h <= 23 => Ok(h as u32),
        _ => Err(AppError::Validation(format!(
            "condition '{}' expects hours in 0..=23",
            kind
        ))),
    }
}

impl TryFrom<StoredCondition> for RuleCondition {
    type Error = AppError;

    fn try_from(stored: StoredCondition) -> Result<Self, Self::Error> {
        let kind = stored.kind.as_str();
        let value = &stored.value;
        let condition = match kind {
            "session_type" => RuleCondition::SessionType(expect_string(kind, value)?),
            "session_duration_min" => {
                RuleCondition::SessionDurationMin(expect_integer(kind, value)?)
            }
            "session_duration_max" => {
                RuleCondition::SessionDurationMax(expect_integer(kind, value)?)
            }
            "user_role" => RuleCondition::UserRole(expect_string(kind, value)?),
            "time_of_day" => RuleCondition::TimeOfDay {
                start_hour: expect_hour(kind, value.get("start"))?,
                end_hour: expect_hour(kind, value.get("end"))?,
            },
            _ => RuleCondition::Unknown {
                kind: stored.kind.clone(),
            },
        };
        Ok(condition)
    }
}

impl From<&RuleCondition> for StoredCondition {
    fn from(condition: &RuleCondition) -> Self {
        let value = match condition {
            RuleCondition::SessionType(v) | RuleCondition::UserRole(v) => {
                serde_json::Value::from(v.clone())
            }
            RuleCondition::SessionDurationMin(v) | RuleCondition::SessionDurationMax(v) => {
                serde_json::Value::from(*v)
            }
            RuleCondition::TimeOfDay {
                start_hour,
                end_hour,
            } => serde_json::json!({ "start": start_hour, "end": end_hour }),
            RuleCondition::Unknown { .. } => serde_json::Value::Null,
        };
        StoredCondition {
            kind: condition.kind().to_string(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_with(conditions_json: &str, key_fields_json: &str) -> NotificationRule {
        NotificationRule {
            id: "r1".to_string(),
            name: "test".to_string(),
            trigger_event: "session_complete".to_string(),
            delay_minutes: 0,
            enabled: true,
            priority: 0,
            template_id: "t1".to_string(),
            conditions_json: conditions_json.to_string(),
            key_fields_json: key_fields_json.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn parses_known_and_unknown_conditions() {
        let rule = rule_with(
            r#"[
                {"type": "session_type", "value": "meditation"},
                {"type": "session_duration_min", "value": 300},
                {"type": "time_of_day", "value": {"start": 22, "end": 6}},
                {"type": "moon_phase", "value": "full"}
            ]"#,
            "[]",
        );
        let conditions = rule.conditions().unwrap();
        assert_eq!(
            conditions,
            vec![
                RuleCondition::SessionType("meditation".to_string()),
                RuleCondition::SessionDurationMin(300),
                RuleCondition::TimeOfDay {
                    start_hour: 22,
                    end_hour: 6
                },
                RuleCondition::Unknown {
                    kind: "moon_phase".to_string()
                },
            ]
        );
    }

    #[test]
    fn rejects_malformed_payload_of_known_kind() {
        let rule = rule_with(r#"[{"type": "session_duration_max", "value": "long"}]"#, "[]");
        assert!(rule.conditions().is_err());

        let rule = rule_with(
            r#"[{"type": "time_of_day", "value": {"start": 9, "end": 24}}]"#,
            "[]",
        );
        assert!(rule.conditions().is_err());
    }

    #[test]
    fn key_fields_keep_declared_order() {
        let rule = rule_with("[]", r#"["session_id", "user_id", "rule_id"]"#);
        assert_eq!(
            rule.key_fields().unwrap(),
            vec![KeyField::SessionId, KeyField::UserId, KeyField::RuleId]
        );
    }

    #[test]
    fn stored_condition_round_trips_through_typed_form() {
        let original = RuleCondition::TimeOfDay {
            start_hour: 8,
            end_hour: 20,
        };
        let stored = StoredCondition::from(&original);
        assert_eq!(stored.kind, "time_of_day");
        assert_eq!(RuleCondition::try_from(stored).unwrap(), original);
    }
}
