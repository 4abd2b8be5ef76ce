use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

// ============================================================================
// Notification Rule Repository
// ============================================================================

pub struct NotificationRuleRepository;

impl NotificationRuleRepository {
    pub async fn create(
        pool: &SqlitePool,
        rule: CreateNotificationRule,
    ) -> AppResult<NotificationRule> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let stored: Vec<StoredCondition> =
            rule.conditions.iter().map(StoredCondition::from).collect();
        let conditions_json = serde_json::to_string(&stored)?;
        let key_fields_json = serde_json::to_string(&rule.key_fields)?;

        let row = sqlx::query_as::<_, NotificationRule>(
            r#"
            INSERT INTO notification_rules (
                id, name, trigger_event, delay_minutes, enabled, priority,
                template_id, conditions_json, key_fields_json, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING
                id, name, trigger_event, delay_minutes, enabled, priority,
                template_id, conditions_json, key_fields_json, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(rule.name)
        .bind(rule.trigger_event)
        .bind(rule.delay_minutes)
        .bind(rule.enabled)
        .bind(rule.priority)
        .bind(rule.template_id)
        .bind(conditions_json)
        .bind(key_fields_json)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Enabled rules for `trigger`, ordered by ascending delay so downstream
    /// processing is deterministic.
    pub async fn get_active_by_trigger(
        pool: &SqlitePool,
        trigger: &str,
    ) -> AppResult<Vec<NotificationRule>> {
        sqlx::query_as::<_, NotificationRule>(
            r#"
            SELECT
                id, name, trigger_event, delay_minutes, enabled, priority,
                template_id, conditions_json, key_fields_json, created_at, updated_at
            FROM notification_rules
            WHERE trigger_event = ? AND enabled = 1
            ORDER BY delay_minutes ASC, priority DESC, id ASC
            "#,
        )
        .bind(trigger)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<NotificationRule>> {
        sqlx::query_as::<_, NotificationRule>(
            r#"
            SELECT
                id, name, trigger_event, delay_minutes, enabled, priority,
                template_id, conditions_json, key_fields_json, created_at, updated_at
            FROM notification_rules
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn set_enabled(pool: &SqlitePool, id: &str, enabled: bool) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE notification_rules SET enabled = ?, updated_at = ? WHERE id = ?",
        )
        .bind(enabled)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("notification rule {}", id)));
        }
        Ok(())
    }
}
