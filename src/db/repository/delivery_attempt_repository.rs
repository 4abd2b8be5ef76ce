use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateDeliveryAttempt, DeliveryAttempt};
use crate::error::{AppError, AppResult};

// ============================================================================
// Delivery Attempt Log Repository
// ============================================================================

pub struct DeliveryAttemptRepository;

impl DeliveryAttemptRepository {
    pub async fn create(
        pool: &SqlitePool,
        attempt: CreateDeliveryAttempt,
    ) -> AppResult<DeliveryAttempt> {
        let id = Uuid::new_v4().to_string();

        sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            INSERT INTO delivery_attempts (
                id, notification_id, attempt_number, attempted_at,
                success, error_code, error_message
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING
                id, notification_id, attempt_number, attempted_at,
                success, error_code, error_message
            "#,
        )
        .bind(id)
        .bind(attempt.notification_id)
        .bind(attempt.attempt_number)
        .bind(Utc::now())
        .bind(attempt.success)
        .bind(attempt.error_code)
        .bind(attempt.error_message)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn list_for_notification(
        pool: &SqlitePool,
        notification_id: &str,
    ) -> AppResult<Vec<DeliveryAttempt>> {
        sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            SELECT
                id, notification_id, attempt_number, attempted_at,
                success, error_code, error_message
            FROM delivery_attempts
            WHERE notification_id = ?
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(notification_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }
}
