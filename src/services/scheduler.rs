use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::{
    CreateScheduledNotification, NotificationMetadata, NotificationRule, ScheduledNotification,
    ScheduledNotificationRepository, UserPreferences,
};
use crate::error::AppResult;
use crate::services::cache::TtlCache;
use crate::services::dedup::{build_fingerprint_key, content_hash, DedupKey, DedupRule, Deduplicator};
use crate::services::quiet_hours::calculate_scheduled_time;
use crate::services::rules::{RuleEngine, SchedulingContext};
use crate::services::stores::{PreferenceStore, SqliteStore};

/// Turns trigger events into persisted, pending notifications.
pub struct NotificationScheduler {
    pool: SqlitePool,
    rules: RuleEngine,
    dedup: Deduplicator,
    preferences: Arc<dyn PreferenceStore>,
    preference_cache: TtlCache<String, UserPreferences>,
}

impl NotificationScheduler {
    pub fn new(
        pool: SqlitePool,
        rules: RuleEngine,
        dedup: Deduplicator,
        preferences: Arc<dyn PreferenceStore>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            rules,
            dedup,
            preferences,
            preference_cache: TtlCache::new(cache_ttl),
        }
    }

    /// Scheduler with every collaborator served from `pool`.
    pub fn from_config(pool: SqlitePool, config: &Config) -> Self {
        let store = Arc::new(SqliteStore::new(pool.clone()));
        let cache_ttl = Duration::from_secs(config.cache.ttl_seconds);
        Self::new(
            pool.clone(),
            RuleEngine::new(store.clone(), store.clone(), cache_ttl),
            Deduplicator::new(pool, config.dedup.clone()),
            store,
            cache_ttl,
        )
    }

    pub fn rule_engine(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.dedup
    }

    /// Schedule every applicable rule for `trigger`.
    ///
    /// Only a rule-store failure is returned as an error. Each rule is
    /// otherwise handled on its own: a rule that fails to schedule is logged
    /// and skipped without affecting the others.
    pub async fn schedule_notifications(
        &self,
        trigger: &str,
        context: &SchedulingContext,
    ) -> AppResult<Vec<ScheduledNotification>> {
        let rules = self.rules.get_active_rules(trigger).await?;
        if rules.is_empty() {
            tracing::debug!("No active rules for trigger {}", trigger);
            return Ok(Vec::new());
        }

        let mut scheduled = Vec::new();
        for rule in &rules {
            match self.schedule_rule(trigger, rule, context).await {
                Ok(Some(notification)) => scheduled.push(notification),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        rule_id = %rule.id,
                        user_id = %context.user_id,
                        error_code = e.code(),
                        "Failed to schedule rule: {}",
                        e
                    );
                }
            }
        }

        tracing::info!(
            "Trigger {} for user {}: {} of {} rule(s) scheduled",
            trigger,
            context.user_id,
            scheduled.len(),
            rules.len()
        );
        Ok(scheduled)
    }

    async fn schedule_rule(
        &self,
        trigger: &str,
        rule: &NotificationRule,
        context: &SchedulingContext,
    ) -> AppResult<Option<ScheduledNotification>> {
        if !self.rules.evaluate_conditions(rule, context).await {
            return Ok(None);
        }

        let key = DedupKey {
            user_id: context.user_id.clone(),
            rule_id: Some(rule.id.clone()),
            session_id: context.session_id.clone(),
            campaign_id: context.campaign_id.clone(),
            content_hash: context.content.as_ref().map(content_hash),
            trigger: Some(trigger.to_string()),
        };
        let dedup_rule = self.rule_dedup_override(trigger, rule);
        if self
            .dedup
            .is_duplicate(&key, trigger, dedup_rule.as_ref())
            .await
        {
            return Ok(None);
        }

        let prefs = self.user_preferences(&context.user_id).await;
        let scheduled_for =
            calculate_scheduled_time(rule.delay_minutes, &prefs.timezone, Some(&prefs))?;

        let effective = self.dedup.effective_rule(trigger, dedup_rule.as_ref());
        let metadata = NotificationMetadata {
            trigger: Some(trigger.to_string()),
            template_id: Some(rule.template_id.clone()),
            priority: Some(rule.priority),
            fingerprint_key: Some(build_fingerprint_key(&key, &effective)).filter(|k| !k.is_empty()),
            timezone: Some(prefs.timezone.clone()),
            frequency: Some(prefs.frequency.clone()),
            additional_data: context.additional_data.clone(),
            ..Default::default()
        };

        let notification = ScheduledNotificationRepository::create(
            &self.pool,
            CreateScheduledNotification {
                rule_id: rule.id.clone(),
                user_id: context.user_id.clone(),
                session_id: context.session_id.clone(),
                campaign_id: context.campaign_id.clone(),
                scheduled_for,
                metadata,
            },
        )
        .await?;

        if let Err(e) = self
            .dedup
            .record_fingerprint(&key, trigger, dedup_rule.as_ref())
            .await
        {
            tracing::warn!(
                "Scheduled notification {} but failed to record its fingerprint: {}",
                notification.id,
                e
            );
        }

        tracing::debug!(
            "Scheduled notification {} (rule {}) for {}",
            notification.id,
            rule.id,
            notification.scheduled_for
        );
        Ok(Some(notification))
    }

    /// A rule with its own key fields deduplicates on those, using the window
    /// of the trigger's profile.
    fn rule_dedup_override(&self, trigger: &str, rule: &NotificationRule) -> Option<DedupRule> {
        let key_fields = match rule.key_fields() {
            Ok(fields) => fields,
            Err(e) => {
                tracing::warn!(
                    "Rule {} has unreadable key fields, using trigger default: {}",
                    rule.id,
                    e
                );
                return None;
            }
        };
        if key_fields.is_empty() {
            return None;
        }
        let window = self.dedup.trigger_window(trigger);
        Some(DedupRule {
            name: format!("rule:{}", rule.id),
            key_fields,
            window_minutes: window.window_minutes,
            max_occurrences: window.max_occurrences,
        })
    }

    /// Stored preferences, or UTC with no quiet hours when unavailable.
    async fn user_preferences(&self, user_id: &str) -> UserPreferences {
        let key = user_id.to_string();
        if let Some(prefs) = self.preference_cache.get(&key).await {
            return prefs;
        }
        match self.preferences.get_user_preferences(user_id).await {
            Ok(found) => {
                let prefs = found.unwrap_or_else(|| UserPreferences::default_for(user_id));
                self.preference_cache.insert(key, prefs.clone()).await;
                prefs
            }
            Err(e) => {
                tracing::warn!(
                    "Could not load preferences for user {}, using defaults: {}",
                    user_id,
                    e
                );
                UserPreferences::default_for(user_id)
            }
        }
    }

    /// Drop cached preferences after they change.
    pub async fn invalidate_preferences(&self, user_id: &str) {
        self.preference_cache.invalidate(&user_id.to_string()).await;
    }
}
