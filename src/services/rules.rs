use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{NotificationRule, RuleCondition};
use crate::error::{AppError, AppResult};
use crate::services::cache::TtlCache;
use crate::services::dedup::NotificationContent;
use crate::services::stores::{RuleStore, UserDirectory};

/// Input describing the event that fired a trigger. Not persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulingContext {
    pub user_id: String,
    pub session_id: Option<String>,
    pub campaign_id: Option<String>,
    pub session_type: Option<String>,
    pub session_duration_seconds: Option<i64>,
    #[serde(default)]
    pub additional_data: serde_json::Value,
    /// Rendered content, when known, for content-based deduplication.
    #[serde(default)]
    pub content: Option<NotificationContent>,
}

impl SchedulingContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}

/// Selects the rules for a trigger and decides whether each one applies.
pub struct RuleEngine {
    rules: Arc<dyn RuleStore>,
    directory: Arc<dyn UserDirectory>,
    roles: TtlCache<String, Option<String>>,
    unknown_conditions: AtomicU64,
}

impl RuleEngine {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        directory: Arc<dyn UserDirectory>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            rules,
            directory,
            roles: TtlCache::new(cache_ttl),
            unknown_conditions: AtomicU64::new(0),
        }
    }

    /// Enabled rules for `trigger`, ordered by ascending `delay_minutes`.
    ///
    /// A store failure is surfaced as [`AppError::RuleQuery`]; the caller
    /// aborts scheduling for this trigger.
    pub async fn get_active_rules(&self, trigger: &str) -> AppResult<Vec<NotificationRule>> {
        let mut rules = self
            .rules
            .get_active_rules(trigger)
            .await
            .map_err(|e| AppError::RuleQuery {
                trigger: trigger.to_string(),
                message: e.to_string(),
            })?;
        rules.retain(|r| r.enabled && r.trigger_event == trigger);
        rules.sort_by_key(|r| r.delay_minutes);
        Ok(rules)
    }

    pub async fn evaluate_conditions(
        &self,
        rule: &NotificationRule,
        context: &SchedulingContext,
    ) -> bool {
        self.evaluate_conditions_at(rule, context, Utc::now()).await
    }

    /// Whether every condition of `rule` holds for `context`, with `now` as
    /// the evaluation instant for `time_of_day`.
    ///
    /// Any failure to evaluate (malformed conditions, directory errors) counts
    /// as not matching for this rule only.
    pub async fn evaluate_conditions_at(
        &self,
        rule: &NotificationRule,
        context: &SchedulingContext,
        now: DateTime<Utc>,
    ) -> bool {
        let conditions = match rule.conditions() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    "Rule {} has unreadable conditions, treating as not met: {}",
                    rule.id,
                    e
                );
                return false;
            }
        };

        for condition in &conditions {
            match self.evaluate_condition(rule, condition, context, now).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        "Rule {} condition '{}' not met for user {}",
                        rule.id,
                        condition.kind(),
                        context.user_id
                    );
                    return false;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to evaluate condition '{}' of rule {}: {}",
                        condition.kind(),
                        rule.id,
                        e
                    );
                    return false;
                }
            }
        }
        true
    }

    async fn evaluate_condition(
        &self,
        rule: &NotificationRule,
        condition: &RuleCondition,
        context: &SchedulingContext,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let met = match condition {
            RuleCondition::SessionType(expected) => {
                context.session_type.as_deref() == Some(expected.as_str())
            }
            RuleCondition::SessionDurationMin(min) => context
                .session_duration_seconds
                .is_some_and(|d| d >= *min),
            RuleCondition::SessionDurationMax(max) => context
                .session_duration_seconds
                .is_some_and(|d| d <= *max),
            RuleCondition::UserRole(expected) => {
                self.user_role(&context.user_id).await?.as_deref() == Some(expected.as_str())
            }
            RuleCondition::TimeOfDay {
                start_hour,
                end_hour,
            } => hour_in_range(now.hour(), *start_hour, *end_hour),
            RuleCondition::Unknown { kind } => {
                let seen = self.unknown_conditions.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    rule_id = %rule.id,
                    condition = %kind,
                    unknown_conditions_total = seen,
                    "Unknown condition kind treated as satisfied"
                );
                true
            }
        };
        Ok(met)
    }

    async fn user_role(&self, user_id: &str) -> AppResult<Option<String>> {
        let key = user_id.to_string();
        if let Some(role) = self.roles.get(&key).await {
            return Ok(role);
        }
        let role = self.directory.get_role(user_id).await?;
        self.roles.insert(key, role.clone()).await;
        Ok(role)
    }

    /// How many times an unrecognized condition kind has been waved through.
    pub fn unknown_condition_count(&self) -> u64 {
        self.unknown_conditions.load(Ordering::Relaxed)
    }

    /// Role lookups are cached; call this when a user's role changes.
    pub async fn invalidate_role(&self, user_id: &str) {
        self.roles.invalidate(&user_id.to_string()).await;
    }
}

/// Inclusive hour range check, wrapping past midnight when `start > end`.
fn hour_in_range(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        start <= hour && hour <= end
    } else {
        hour >= start || hour <= end
    }
}
