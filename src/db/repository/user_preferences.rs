use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

// ============================================================================
// User Preferences Repository
// ============================================================================

pub struct UserPreferencesRepository;

impl UserPreferencesRepository {
    pub async fn find_by_user_id(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Option<UserPreferences>> {
        sqlx::query_as::<_, UserPreferences>(
            r#"
            SELECT user_id, timezone, quiet_hours_start, quiet_hours_end, frequency, updated_at
            FROM user_preferences
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn upsert(pool: &SqlitePool, prefs: &UserPreferences) -> AppResult<UserPreferences> {
        sqlx::query_as::<_, UserPreferences>(
            r#"
            INSERT INTO user_preferences (
                user_id, timezone, quiet_hours_start, quiet_hours_end, frequency, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                timezone = excluded.timezone,
                quiet_hours_start = excluded.quiet_hours_start,
                quiet_hours_end = excluded.quiet_hours_end,
                frequency = excluded.frequency,
                updated_at = excluded.updated_at
            RETURNING user_id, timezone, quiet_hours_start, quiet_hours_end, frequency, updated_at
            "#,
        )
        .bind(&prefs.user_id)
        .bind(&prefs.timezone)
        .bind(&prefs.quiet_hours_start)
        .bind(&prefs.quiet_hours_end)
        .bind(&prefs.frequency)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }
}
