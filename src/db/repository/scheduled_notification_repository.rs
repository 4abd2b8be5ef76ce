use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::db::models::{
    CancelFilter, CreateScheduledNotification, NotificationStatus, ScheduledNotification,
};
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id,
    rule_id,
    user_id,
    session_id,
    campaign_id,
    scheduled_for,
    status,
    retry_count,
    next_retry,
    last_error,
    metadata_json,
    claimed_at,
    sent_at,
    created_at,
    updated_at
"#;

/// Repository for the durable delivery queue (`scheduled_notifications`).
///
/// Implementation notes:
/// - Every state transition is a single conditional UPDATE guarded on the
///   current status, so concurrent workers and cancellations cannot both win.
/// - Claiming uses `UPDATE ... WHERE id = (SELECT id ... LIMIT 1) AND status = 'pending'
///   RETURNING ...`, one row per statement, to avoid long-lived transactions on SQLite.
/// - "now" is always bound from Rust so stored and compared timestamps share a format.
pub struct ScheduledNotificationRepository;

impl ScheduledNotificationRepository {
    /// Persist a new notification as `pending` with `retry_count = 0`.
    pub async fn create<'e, E>(
        executor: E,
        notification: CreateScheduledNotification,
    ) -> AppResult<ScheduledNotification>
    where
        E: SqliteExecutor<'e>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let metadata_json = serde_json::to_string(&notification.metadata)?;

        let row = sqlx::query_as::<_, ScheduledNotification>(&format!(
            r#"
            INSERT INTO scheduled_notifications (
                id, rule_id, user_id, session_id, campaign_id, scheduled_for,
                status, retry_count, next_retry, last_error, metadata_json,
                claimed_at, sent_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, NULL, NULL, ?, NULL, NULL, ?, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(notification.rule_id)
        .bind(notification.user_id)
        .bind(notification.session_id)
        .bind(notification.campaign_id)
        .bind(notification.scheduled_for)
        .bind(metadata_json)
        .bind(now)
        .bind(now)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: &str,
    ) -> AppResult<Option<ScheduledNotification>> {
        sqlx::query_as::<_, ScheduledNotification>(&format!(
            "SELECT {COLUMNS} FROM scheduled_notifications WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn list_by_user(
        pool: &SqlitePool,
        user_id: &str,
        status: Option<NotificationStatus>,
    ) -> AppResult<Vec<ScheduledNotification>> {
        let status = status.map(|s| s.as_str());
        sqlx::query_as::<_, ScheduledNotification>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM scheduled_notifications
            WHERE user_id = ?
              AND (? IS NULL OR status = ?)
            ORDER BY scheduled_for ASC, created_at ASC
            "#
        ))
        .bind(user_id)
        .bind(status)
        .bind(status)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Atomically move a single row from `pending` to `processing`.
    ///
    /// Returns `true` only if this call performed the transition.
    pub async fn claim(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = 'processing', claimed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    /// Claim up to `limit` due notifications and return them in `processing` state.
    ///
    /// A row is due when it is `pending` and either has never failed and its
    /// `scheduled_for` has passed, or has failed before and its `next_retry`
    /// has passed.
    pub async fn fetch_and_claim_due(
        pool: &SqlitePool,
        limit: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<ScheduledNotification>> {
        let mut claimed: Vec<ScheduledNotification> = Vec::new();
        if limit <= 0 {
            return Ok(claimed);
        }

        for _ in 0..(limit as usize) {
            let claimed_at = Utc::now();

            let opt = sqlx::query_as::<_, ScheduledNotification>(&format!(
                r#"
                UPDATE scheduled_notifications
                SET status = 'processing', claimed_at = ?, updated_at = ?
                WHERE id = (
                    SELECT id FROM scheduled_notifications
                    WHERE status = 'pending'
                      AND (
                        (retry_count = 0 AND scheduled_for <= ?)
                        OR (retry_count > 0 AND COALESCE(next_retry, scheduled_for) <= ?)
                      )
                    ORDER BY COALESCE(next_retry, scheduled_for) ASC
                    LIMIT 1
                )
                AND status = 'pending'
                RETURNING {COLUMNS}
                "#
            ))
            .bind(claimed_at)
            .bind(claimed_at)
            .bind(now)
            .bind(now)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

            match opt {
                Some(notification) => claimed.push(notification),
                None => break,
            }
        }

        Ok(claimed)
    }

    /// `processing -> sent`. Returns `None` if the row was not in `processing`.
    pub async fn mark_sent(
        pool: &SqlitePool,
        id: &str,
    ) -> AppResult<Option<ScheduledNotification>> {
        let now = Utc::now();
        sqlx::query_as::<_, ScheduledNotification>(&format!(
            r#"
            UPDATE scheduled_notifications
            SET status = 'sent', sent_at = ?, next_retry = NULL, claimed_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'processing'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// `processing -> pending` with a new retry count and due time.
    pub async fn schedule_retry(
        pool: &SqlitePool,
        id: &str,
        retry_count: i32,
        next_retry: DateTime<Utc>,
        last_error: Option<String>,
        metadata_json: &str,
    ) -> AppResult<Option<ScheduledNotification>> {
        sqlx::query_as::<_, ScheduledNotification>(&format!(
            r#"
            UPDATE scheduled_notifications
            SET
                status = 'pending',
                retry_count = ?,
                next_retry = ?,
                last_error = ?,
                metadata_json = ?,
                claimed_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'processing'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(retry_count)
        .bind(next_retry)
        .bind(last_error)
        .bind(metadata_json)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Mark a non-terminal row as `failed`. Takes any executor so it can run
    /// inside the dead-letter transaction.
    pub async fn mark_failed<'e, E>(
        executor: E,
        id: &str,
        retry_count: i32,
        last_error: Option<&str>,
        metadata_json: &str,
    ) -> AppResult<bool>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET
                status = 'failed',
                retry_count = ?,
                last_error = ?,
                metadata_json = ?,
                next_retry = NULL,
                claimed_at = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(retry_count)
        .bind(last_error)
        .bind(metadata_json)
        .bind(Utc::now())
        .bind(id)
        .execute(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel the given notifications. Rows that are not `pending` are left
    /// untouched. Returns the number of rows cancelled.
    pub async fn cancel_by_ids(pool: &SqlitePool, ids: &[String]) -> AppResult<u64> {
        let mut cancelled = 0;
        for id in ids {
            let result = sqlx::query(
                r#"
                UPDATE scheduled_notifications
                SET status = 'cancelled', next_retry = NULL, updated_at = ?
                WHERE id = ? AND status = 'pending'
                "#,
            )
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
            cancelled += result.rows_affected();
        }
        Ok(cancelled)
    }

    /// Cancel every `pending` notification matching `filter`.
    pub async fn cancel_matching(pool: &SqlitePool, filter: &CancelFilter) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = 'cancelled', next_retry = NULL, updated_at = ?
            WHERE status = 'pending'
              AND user_id = ?
              AND (? IS NULL OR session_id = ?)
              AND (? IS NULL OR campaign_id = ?)
              AND (? IS NULL OR rule_id = ?)
            "#,
        )
        .bind(Utc::now())
        .bind(&filter.user_id)
        .bind(&filter.session_id)
        .bind(&filter.session_id)
        .bind(&filter.campaign_id)
        .bind(&filter.campaign_id)
        .bind(&filter.rule_id)
        .bind(&filter.rule_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Return rows stuck in `processing` since before `claimed_before` to
    /// `pending`, e.g. after a worker crashed mid-delivery.
    pub async fn release_stale_claims(
        pool: &SqlitePool,
        claimed_before: DateTime<Utc>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = 'pending', claimed_at = NULL, updated_at = ?
            WHERE status = 'processing' AND claimed_at IS NOT NULL AND claimed_at < ?
            "#,
        )
        .bind(Utc::now())
        .bind(claimed_before)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}
