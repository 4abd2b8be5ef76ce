use chrono::Utc;
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::db::models::{CreateDeadLetter, DeadLetterNotification};
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id,
    original_notification_id,
    user_id,
    rule_id,
    template_id,
    failure_reason,
    retry_attempts,
    last_error,
    metadata_json,
    requeued,
    requeued_at,
    requeued_notification_id,
    created_at
"#;

// ============================================================================
// Dead Letter Repository
// ============================================================================

pub struct DeadLetterRepository;

impl DeadLetterRepository {
    pub async fn create<'e, E>(executor: E, entry: CreateDeadLetter) -> AppResult<DeadLetterNotification>
    where
        E: SqliteExecutor<'e>,
    {
        let id = Uuid::new_v4().to_string();
        let metadata_json = serde_json::to_string(&entry.metadata)?;

        sqlx::query_as::<_, DeadLetterNotification>(&format!(
            r#"
            INSERT INTO dead_letter_notifications (
                id, original_notification_id, user_id, rule_id, template_id,
                failure_reason, retry_attempts, last_error, metadata_json,
                requeued, requeued_at, requeued_notification_id, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(entry.original_notification_id)
        .bind(entry.user_id)
        .bind(entry.rule_id)
        .bind(entry.template_id)
        .bind(entry.failure_reason)
        .bind(entry.retry_attempts)
        .bind(entry.last_error)
        .bind(metadata_json)
        .bind(Utc::now())
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: &str,
    ) -> AppResult<Option<DeadLetterNotification>> {
        sqlx::query_as::<_, DeadLetterNotification>(&format!(
            "SELECT {COLUMNS} FROM dead_letter_notifications WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// List entries, newest first.
    pub async fn list(
        pool: &SqlitePool,
        user_id: Option<&str>,
        include_requeued: bool,
        limit: i64,
    ) -> AppResult<Vec<DeadLetterNotification>> {
        sqlx::query_as::<_, DeadLetterNotification>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM dead_letter_notifications
            WHERE (? IS NULL OR user_id = ?)
              AND (? = 1 OR requeued = 0)
            ORDER BY created_at DESC
            LIMIT ?
            "#
        ))
        .bind(user_id)
        .bind(user_id)
        .bind(include_requeued)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Flag an entry as requeued. Returns `false` if it was already requeued.
    pub async fn mark_requeued<'e, E>(
        executor: E,
        id: &str,
        requeued_notification_id: &str,
    ) -> AppResult<bool>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE dead_letter_notifications
            SET requeued = 1, requeued_at = ?, requeued_notification_id = ?
            WHERE id = ? AND requeued = 0
            "#,
        )
        .bind(Utc::now())
        .bind(requeued_notification_id)
        .bind(id)
        .execute(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }
}
