//! Collaborator seams consumed by the scheduling core, with SQLite-backed
//! implementations.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db::{
    NotificationRule, NotificationRuleRepository, UserPreferences, UserPreferencesRepository,
    UserRepository,
};
use crate::error::AppResult;

#[async_trait]
pub trait RuleStore: Send + Sync + 'static {
    /// Enabled rules for `trigger`, ordered by ascending delay.
    async fn get_active_rules(&self, trigger: &str) -> AppResult<Vec<NotificationRule>>;
}

#[async_trait]
pub trait PreferenceStore: Send + Sync + 'static {
    /// Stored preferences, or `None` when the user has never set any.
    async fn get_user_preferences(&self, user_id: &str) -> AppResult<Option<UserPreferences>>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    async fn get_role(&self, user_id: &str) -> AppResult<Option<String>>;
}

/// All collaborator seams served from the application database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn get_active_rules(&self, trigger: &str) -> AppResult<Vec<NotificationRule>> {
        NotificationRuleRepository::get_active_by_trigger(&self.pool, trigger).await
    }
}

#[async_trait]
impl PreferenceStore for SqliteStore {
    async fn get_user_preferences(&self, user_id: &str) -> AppResult<Option<UserPreferences>> {
        UserPreferencesRepository::find_by_user_id(&self.pool, user_id).await
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn get_role(&self, user_id: &str) -> AppResult<Option<String>> {
        Ok(UserRepository::find_by_id(&self.pool, user_id)
            .await?
            .map(|u| u.role))
    }
}
