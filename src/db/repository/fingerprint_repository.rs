use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateFingerprint, NotificationFingerprint};
use crate::error::{AppError, AppResult};

// ============================================================================
// Notification Fingerprint Repository
// ============================================================================

pub struct FingerprintRepository;

impl FingerprintRepository {
    /// Sum of `occurrence_count` over every fingerprint with `key` that has
    /// not expired at `now`.
    pub async fn sum_active_occurrences(
        pool: &SqlitePool,
        key: &str,
        now: DateTime<Utc>,
    ) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(occurrence_count), 0)
            FROM notification_fingerprints
            WHERE fingerprint_key = ? AND expires_at > ?
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_active(
        pool: &SqlitePool,
        key: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<NotificationFingerprint>> {
        sqlx::query_as::<_, NotificationFingerprint>(
            r#"
            SELECT
                id, fingerprint_key, user_id, rule_id, session_id, campaign_id,
                content_hash, occurrence_count, created_at, expires_at
            FROM notification_fingerprints
            WHERE fingerprint_key = ? AND expires_at > ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Increment the newest active fingerprint for `key` and push its expiry
    /// to `expires_at`. Returns `None` when no active fingerprint exists.
    pub async fn increment_active(
        pool: &SqlitePool,
        key: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Option<NotificationFingerprint>> {
        sqlx::query_as::<_, NotificationFingerprint>(
            r#"
            UPDATE notification_fingerprints
            SET occurrence_count = occurrence_count + 1, expires_at = ?
            WHERE id = (
                SELECT id FROM notification_fingerprints
                WHERE fingerprint_key = ? AND expires_at > ?
                ORDER BY created_at DESC
                LIMIT 1
            )
            RETURNING
                id, fingerprint_key, user_id, rule_id, session_id, campaign_id,
                content_hash, occurrence_count, created_at, expires_at
            "#,
        )
        .bind(expires_at)
        .bind(key)
        .bind(now)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn create(
        pool: &SqlitePool,
        fingerprint: CreateFingerprint,
    ) -> AppResult<NotificationFingerprint> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query_as::<_, NotificationFingerprint>(
            r#"
            INSERT INTO notification_fingerprints (
                id, fingerprint_key, user_id, rule_id, session_id, campaign_id,
                content_hash, occurrence_count, created_at, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            RETURNING
                id, fingerprint_key, user_id, rule_id, session_id, campaign_id,
                content_hash, occurrence_count, created_at, expires_at
            "#,
        )
        .bind(id)
        .bind(fingerprint.fingerprint_key)
        .bind(fingerprint.user_id)
        .bind(fingerprint.rule_id)
        .bind(fingerprint.session_id)
        .bind(fingerprint.campaign_id)
        .bind(fingerprint.content_hash)
        .bind(now)
        .bind(fingerprint.expires_at)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Delete fingerprints that expired at or before `now`.
    pub async fn delete_expired(pool: &SqlitePool, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM notification_fingerprints WHERE expires_at <= ?")
            .bind(now)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }
}
