//! Fingerprint-based deduplication.
//!
//! A fingerprint key is built from a dedup rule's key fields, in declared
//! order, as `field:value` segments joined by `|`. Occurrences are counted per
//! key over fingerprints that have not yet expired.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::config::{DedupConfig, DedupProfile, DedupWindow};
use crate::db::{CreateFingerprint, FingerprintRepository, KeyField, NotificationFingerprint};
use crate::error::{AppError, AppResult};

const KEY_DELIMITER: &str = "|";

/// Notification content as seen by content-based deduplication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationContent {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

fn canonical_str(s: &str) -> String {
    s.trim().to_lowercase()
}

fn canonical_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(canonical_str(s)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonical_value).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (canonical_str(k), canonical_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Stable hash of `content` that ignores surrounding whitespace and case.
pub fn content_hash(content: &NotificationContent) -> String {
    let variables: BTreeMap<String, serde_json::Value> = content
        .variables
        .iter()
        .map(|(k, v)| (canonical_str(k), canonical_value(v)))
        .collect();
    let canonical = serde_json::json!({
        "title": canonical_str(&content.title),
        "message": canonical_str(&content.message),
        "actionUrl": content.action_url.as_deref().map(canonical_str),
        "variables": variables,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Values a fingerprint key may draw from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupKey {
    pub user_id: String,
    pub rule_id: Option<String>,
    pub session_id: Option<String>,
    pub campaign_id: Option<String>,
    pub content_hash: Option<String>,
    pub trigger: Option<String>,
}

impl DedupKey {
    pub fn get(&self, field: KeyField) -> Option<&str> {
        let value = match field {
            KeyField::UserId => Some(self.user_id.as_str()),
            KeyField::RuleId => self.rule_id.as_deref(),
            KeyField::SessionId => self.session_id.as_deref(),
            KeyField::CampaignId => self.campaign_id.as_deref(),
            KeyField::ContentHash => self.content_hash.as_deref(),
            KeyField::Trigger => self.trigger.as_deref(),
        };
        value.filter(|v| !v.is_empty())
    }
}

/// Effective deduplication policy for one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRule {
    pub name: String,
    pub key_fields: Vec<KeyField>,
    pub window_minutes: i64,
    pub max_occurrences: i64,
}

impl DedupRule {
    pub fn for_profile(profile: DedupProfile, window: DedupWindow) -> Self {
        let key_fields = match profile {
            DedupProfile::Session => vec![KeyField::UserId, KeyField::SessionId, KeyField::RuleId],
            DedupProfile::Campaign => {
                vec![KeyField::UserId, KeyField::CampaignId, KeyField::RuleId]
            }
            DedupProfile::Content => vec![KeyField::UserId, KeyField::ContentHash],
            DedupProfile::TimeBased => vec![KeyField::UserId, KeyField::RuleId],
        };
        Self {
            name: profile.as_str().to_string(),
            key_fields,
            window_minutes: window.window_minutes,
            max_occurrences: window.max_occurrences,
        }
    }
}

/// Build the fingerprint key for `key` under `rule`. Fields absent from `key`
/// are skipped.
pub fn build_fingerprint_key(key: &DedupKey, rule: &DedupRule) -> String {
    rule.key_fields
        .iter()
        .filter_map(|field| key.get(*field).map(|v| format!("{}:{}", field.as_str(), v)))
        .collect::<Vec<_>>()
        .join(KEY_DELIMITER)
}

pub struct Deduplicator {
    pool: SqlitePool,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(pool: SqlitePool, config: DedupConfig) -> Self {
        Self { pool, config }
    }

    /// The explicit override if given, else the trigger's profile (which
    /// itself falls back to the session profile).
    pub fn effective_rule(&self, trigger: &str, rule: Option<&DedupRule>) -> DedupRule {
        match rule {
            Some(r) => r.clone(),
            None => {
                let profile = self.config.profile_for_trigger(trigger);
                DedupRule::for_profile(profile, self.config.window(profile))
            }
        }
    }

    /// Window settings of the trigger's profile, used when a notification
    /// rule supplies its own key fields.
    pub fn trigger_window(&self, trigger: &str) -> DedupWindow {
        self.config.window(self.config.profile_for_trigger(trigger))
    }

    pub async fn is_duplicate(&self, key: &DedupKey, trigger: &str, rule: Option<&DedupRule>) -> bool {
        self.is_duplicate_at(key, trigger, rule, Utc::now()).await
    }

    /// Whether the active occurrences for this key already reach the rule's
    /// limit. Read-only. Storage failures are treated as "not a duplicate".
    pub async fn is_duplicate_at(
        &self,
        key: &DedupKey,
        trigger: &str,
        rule: Option<&DedupRule>,
        now: DateTime<Utc>,
    ) -> bool {
        let rule = self.effective_rule(trigger, rule);
        let fingerprint_key = build_fingerprint_key(key, &rule);
        if fingerprint_key.is_empty() {
            tracing::warn!(
                "Dedup rule '{}' produced an empty key for trigger {}; skipping check",
                rule.name,
                trigger
            );
            return false;
        }

        match FingerprintRepository::sum_active_occurrences(&self.pool, &fingerprint_key, now).await
        {
            Ok(occurrences) => {
                let duplicate = occurrences >= rule.max_occurrences;
                if duplicate {
                    tracing::info!(
                        "Duplicate suppressed: key={} occurrences={} max={} window={}m",
                        fingerprint_key,
                        occurrences,
                        rule.max_occurrences,
                        rule.window_minutes
                    );
                }
                duplicate
            }
            Err(e) => {
                tracing::warn!(
                    "Dedup lookup failed for key {}, allowing notification: {}",
                    fingerprint_key,
                    e
                );
                false
            }
        }
    }

    pub async fn record_fingerprint(
        &self,
        key: &DedupKey,
        trigger: &str,
        rule: Option<&DedupRule>,
    ) -> AppResult<Option<NotificationFingerprint>> {
        self.record_fingerprint_at(key, trigger, rule, Utc::now()).await
    }

    /// Count one occurrence: bump the active fingerprint and extend its
    /// expiry, or start a new one at 1. Returns `None` when the key is empty.
    pub async fn record_fingerprint_at(
        &self,
        key: &DedupKey,
        trigger: &str,
        rule: Option<&DedupRule>,
        now: DateTime<Utc>,
    ) -> AppResult<Option<NotificationFingerprint>> {
        let rule = self.effective_rule(trigger, rule);
        let fingerprint_key = build_fingerprint_key(key, &rule);
        if fingerprint_key.is_empty() {
            return Ok(None);
        }
        let expires_at = Duration::try_minutes(rule.window_minutes)
            .and_then(|window| now.checked_add_signed(window))
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "dedup window of {} minutes is out of range",
                    rule.window_minutes
                ))
            })?;

        if let Some(updated) =
            FingerprintRepository::increment_active(&self.pool, &fingerprint_key, now, expires_at)
                .await?
        {
            tracing::debug!(
                "Fingerprint {} now at {} occurrence(s)",
                fingerprint_key,
                updated.occurrence_count
            );
            return Ok(Some(updated));
        }

        let created = FingerprintRepository::create(
            &self.pool,
            CreateFingerprint {
                fingerprint_key,
                user_id: key.user_id.clone(),
                rule_id: key.rule_id.clone(),
                session_id: key.session_id.clone(),
                campaign_id: key.campaign_id.clone(),
                content_hash: key.content_hash.clone(),
                expires_at,
            },
        )
        .await?;
        Ok(Some(created))
    }

    /// Delete expired fingerprints. Only reclaims storage; expired rows are
    /// already ignored by counting.
    pub async fn cleanup_expired(&self) -> AppResult<u64> {
        FingerprintRepository::delete_expired(&self.pool, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::test_pool;

    fn session_key() -> DedupKey {
        DedupKey {
            user_id: "U1".to_string(),
            rule_id: Some("R1".to_string()),
            session_id: Some("S1".to_string()),
            ..Default::default()
        }
    }

    async fn deduplicator() -> Deduplicator {
        Deduplicator::new(test_pool().await, Config::default().dedup)
    }

    #[tokio::test]
    async fn out_of_range_window_fails_to_record() {
        let dedup = deduplicator().await;
        let rule = DedupRule {
            name: "huge".to_string(),
            key_fields: vec![KeyField::UserId],
            window_minutes: i64::MAX,
            max_occurrences: 1,
        };
        let err = dedup
            .record_fingerprint(&session_key(), "session_complete", Some(&rule))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(!dedup.is_duplicate(&session_key(), "session_complete", Some(&rule)).await);
    }

    #[test]
    fn key_follows_declared_field_order_and_skips_missing() {
        let rule = DedupRule {
            name: "custom".to_string(),
            key_fields: vec![KeyField::SessionId, KeyField::CampaignId, KeyField::UserId],
            window_minutes: 60,
            max_occurrences: 1,
        };
        assert_eq!(
            build_fingerprint_key(&session_key(), &rule),
            "session_id:S1|user_id:U1"
        );
    }

    #[test]
    fn different_key_fields_give_different_keys() {
        let cfg = Config::default().dedup;
        let session = DedupRule::for_profile(DedupProfile::Session, cfg.session);
        let time_based = DedupRule::for_profile(DedupProfile::TimeBased, cfg.time_based);
        assert_eq!(
            build_fingerprint_key(&session_key(), &session),
            "user_id:U1|session_id:S1|rule_id:R1"
        );
        assert_ne!(
            build_fingerprint_key(&session_key(), &session),
            build_fingerprint_key(&session_key(), &time_based)
        );
    }

    #[test]
    fn content_hash_ignores_case_and_whitespace() {
        let a = NotificationContent {
            title: "  Great Session! ".to_string(),
            message: "You meditated for 10 minutes".to_string(),
            action_url: Some("HTTPS://app/sessions/1".to_string()),
            variables: BTreeMap::from([("Minutes".to_string(), serde_json::json!(" Ten "))]),
        };
        let b = NotificationContent {
            title: "great session!".to_string(),
            message: "  YOU MEDITATED FOR 10 MINUTES".to_string(),
            action_url: Some("https://app/sessions/1 ".to_string()),
            variables: BTreeMap::from([("minutes".to_string(), serde_json::json!("ten"))]),
        };
        assert_eq!(content_hash(&a), content_hash(&b));

        let c = NotificationContent {
            message: "You meditated for 20 minutes".to_string(),
            ..a.clone()
        };
        assert_ne!(content_hash(&a), content_hash(&c));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[tokio::test]
    async fn recording_twice_counts_two_occurrences() {
        let dedup = deduplicator().await;
        let rule = DedupRule {
            name: "content".to_string(),
            key_fields: vec![KeyField::UserId, KeyField::RuleId],
            window_minutes: 720,
            max_occurrences: 2,
        };
        let key = session_key();

        assert!(!dedup.is_duplicate(&key, "content_published", Some(&rule)).await);
        let first = dedup
            .record_fingerprint(&key, "content_published", Some(&rule))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.occurrence_count, 1);
        assert!(!dedup.is_duplicate(&key, "content_published", Some(&rule)).await);

        let second = dedup
            .record_fingerprint(&key, "content_published", Some(&rule))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.occurrence_count, 2);
        assert!(second.expires_at >= first.expires_at);
        assert!(dedup.is_duplicate(&key, "content_published", Some(&rule)).await);
    }

    #[tokio::test]
    async fn is_duplicate_does_not_mutate() {
        let dedup = deduplicator().await;
        let key = session_key();
        for _ in 0..3 {
            assert!(!dedup.is_duplicate(&key, "session_complete", None).await);
        }
        let active = FingerprintRepository::find_active(
            &dedup.pool,
            "user_id:U1|session_id:S1|rule_id:R1",
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn expired_fingerprints_do_not_count() {
        let dedup = deduplicator().await;
        let key = session_key();
        let long_ago = Utc::now() - Duration::hours(3);
        dedup
            .record_fingerprint_at(&key, "session_complete", None, long_ago)
            .await
            .unwrap();

        assert!(!dedup.is_duplicate(&key, "session_complete", None).await);
        assert!(
            dedup
                .is_duplicate_at(&key, "session_complete", None, long_ago + Duration::minutes(30))
                .await
        );

        // A new occurrence starts a fresh fingerprint instead of reviving the old one.
        let fresh = dedup
            .record_fingerprint(&key, "session_complete", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.occurrence_count, 1);

        assert_eq!(dedup.cleanup_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lookup_failure_fails_open() {
        let pool = test_pool().await;
        let dedup = Deduplicator::new(pool.clone(), Config::default().dedup);
        dedup
            .record_fingerprint(&session_key(), "session_complete", None)
            .await
            .unwrap();
        assert!(dedup.is_duplicate(&session_key(), "session_complete", None).await);

        pool.close().await;
        assert!(!dedup.is_duplicate(&session_key(), "session_complete", None).await);
    }

    #[tokio::test]
    async fn trigger_index_selects_profile() {
        let dedup = deduplicator().await;
        let campaign = dedup.effective_rule("campaign_launch", None);
        assert_eq!(campaign.name, "campaign");
        assert_eq!(campaign.window_minutes, 1440);

        let fallback = dedup.effective_rule("brand_new_trigger", None);
        assert_eq!(fallback.name, "session");
        assert_eq!(fallback.window_minutes, 60);
    }
}
