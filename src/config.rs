use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub retry: RetryConfig,
    pub dedup: DedupConfig,
    pub delivery: DeliveryConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Whether the delivery/retry worker is enabled.
    pub enabled: bool,
    /// Failed attempts tolerated before a notification is dead-lettered.
    pub max_retries: u32,
    /// Delay before the first retry, in minutes.
    pub base_delay_minutes: u64,
    /// Cap for exponential backoff, in minutes.
    pub max_delay_minutes: u64,
    /// Growth factor applied per failed attempt.
    pub multiplier: f64,
    /// Symmetric jitter applied to every computed delay (0.2 = ±20%).
    pub jitter_ratio: f64,
    /// How often (seconds) the worker polls for due notifications.
    pub poll_interval_seconds: u64,
    /// Maximum rows claimed per poll.
    pub batch_size: u32,
    /// Maximum claimed rows delivered in parallel.
    pub worker_concurrency: u32,
    /// Rows left in `processing` longer than this are returned to `pending`.
    pub claim_timeout_seconds: u64,
}

/// Named deduplication policies. Each one fixes the key fields used to build
/// the fingerprint; window and occurrence limits are tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupProfile {
    Session,
    Campaign,
    Content,
    TimeBased,
}

impl DedupProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupProfile::Session => "session",
            DedupProfile::Campaign => "campaign",
            DedupProfile::Content => "content",
            DedupProfile::TimeBased => "time_based",
        }
    }
}

impl FromStr for DedupProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "session" => Ok(DedupProfile::Session),
            "campaign" => Ok(DedupProfile::Campaign),
            "content" => Ok(DedupProfile::Content),
            "time_based" | "time" | "inactivity" => Ok(DedupProfile::TimeBased),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown dedup profile '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DedupWindow {
    pub window_minutes: i64,
    pub max_occurrences: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    pub session: DedupWindow,
    pub campaign: DedupWindow,
    pub content: DedupWindow,
    pub time_based: DedupWindow,
    /// Trigger name -> profile used when a rule carries no key fields of its own.
    pub trigger_profiles: HashMap<String, DedupProfile>,
    /// How often (seconds) expired fingerprints are swept.
    pub sweep_interval_seconds: u64,
}

impl DedupConfig {
    pub fn window(&self, profile: DedupProfile) -> DedupWindow {
        match profile {
            DedupProfile::Session => self.session,
            DedupProfile::Campaign => self.campaign,
            DedupProfile::Content => self.content,
            DedupProfile::TimeBased => self.time_based,
        }
    }

    /// Profile indexed by trigger, falling back to the session profile.
    pub fn profile_for_trigger(&self, trigger: &str) -> DedupProfile {
        self.trigger_profiles
            .get(trigger)
            .copied()
            .unwrap_or(DedupProfile::Session)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Endpoint that receives delivery requests. The delivery worker does not
    /// start without it.
    pub webhook_url: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL (seconds) for cached preference and role lookups.
    pub ttl_seconds: u64,
}

fn default_trigger_profiles() -> HashMap<String, DedupProfile> {
    [
        ("session_complete", DedupProfile::Session),
        ("session_start", DedupProfile::Session),
        ("session_reminder", DedupProfile::Session),
        ("campaign_launch", DedupProfile::Campaign),
        ("campaign_reminder", DedupProfile::Campaign),
        ("content_published", DedupProfile::Content),
        ("user_inactive", DedupProfile::TimeBased),
        ("inactivity_reminder", DedupProfile::TimeBased),
    ]
    .into_iter()
    .map(|(trigger, profile)| (trigger.to_string(), profile))
    .collect()
}

/// Parse `trigger=profile,trigger=profile` pairs.
fn parse_trigger_profiles(raw: &str) -> Result<HashMap<String, DedupProfile>, ConfigError> {
    let mut map = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (trigger, profile) = pair.split_once('=').ok_or_else(|| {
            ConfigError::InvalidValue(format!("DEDUP_TRIGGER_PROFILES entry '{}'", pair))
        })?;
        map.insert(trigger.trim().to_string(), profile.parse()?);
    }
    Ok(map)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn dedup_window_from_env(prefix: &str, default: DedupWindow) -> DedupWindow {
    DedupWindow {
        window_minutes: env_or(
            &format!("DEDUP_{}_WINDOW_MINUTES", prefix),
            default.window_minutes,
        ),
        max_occurrences: env_or(
            &format!("DEDUP_{}_MAX_OCCURRENCES", prefix),
            default.max_occurrences,
        ),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let mut trigger_profiles = defaults.dedup.trigger_profiles.clone();
        if let Ok(raw) = env::var("DEDUP_TRIGGER_PROFILES") {
            trigger_profiles.extend(parse_trigger_profiles(&raw)?);
        }

        let multiplier: f64 = env_or("NOTIFICATION_RETRY_MULTIPLIER", defaults.retry.multiplier);
        if multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "NOTIFICATION_RETRY_MULTIPLIER".to_string(),
            ));
        }
        let jitter_ratio: f64 =
            env_or("NOTIFICATION_RETRY_JITTER_RATIO", defaults.retry.jitter_ratio);
        if !(0.0..1.0).contains(&jitter_ratio) {
            return Err(ConfigError::InvalidValue(
                "NOTIFICATION_RETRY_JITTER_RATIO".to_string(),
            ));
        }

        Ok(Config {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                ),
            },
            retry: RetryConfig {
                enabled: env_flag("NOTIFICATION_RETRY_ENABLED", defaults.retry.enabled),
                max_retries: env_or("NOTIFICATION_RETRY_MAX_RETRIES", defaults.retry.max_retries),
                base_delay_minutes: env_or(
                    "NOTIFICATION_RETRY_BASE_DELAY_MINUTES",
                    defaults.retry.base_delay_minutes,
                ),
                max_delay_minutes: env_or(
                    "NOTIFICATION_RETRY_MAX_DELAY_MINUTES",
                    defaults.retry.max_delay_minutes,
                ),
                multiplier,
                jitter_ratio,
                poll_interval_seconds: env_or(
                    "NOTIFICATION_RETRY_POLL_INTERVAL_SECONDS",
                    defaults.retry.poll_interval_seconds,
                ),
                batch_size: env_or("NOTIFICATION_RETRY_BATCH_SIZE", defaults.retry.batch_size),
                worker_concurrency: env_or(
                    "NOTIFICATION_RETRY_WORKER_CONCURRENCY",
                    defaults.retry.worker_concurrency,
                ),
                claim_timeout_seconds: env_or(
                    "NOTIFICATION_RETRY_CLAIM_TIMEOUT_SECONDS",
                    defaults.retry.claim_timeout_seconds,
                ),
            },
            dedup: DedupConfig {
                session: dedup_window_from_env("SESSION", defaults.dedup.session),
                campaign: dedup_window_from_env("CAMPAIGN", defaults.dedup.campaign),
                content: dedup_window_from_env("CONTENT", defaults.dedup.content),
                time_based: dedup_window_from_env("TIME_BASED", defaults.dedup.time_based),
                trigger_profiles,
                sweep_interval_seconds: env_or(
                    "DEDUP_SWEEP_INTERVAL_SECONDS",
                    defaults.dedup.sweep_interval_seconds,
                ),
            },
            delivery: DeliveryConfig {
                webhook_url: env::var("DELIVERY_WEBHOOK_URL")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
                timeout_seconds: env_or(
                    "DELIVERY_TIMEOUT_SECONDS",
                    defaults.delivery.timeout_seconds,
                ),
            },
            cache: CacheConfig {
                ttl_seconds: env_or("CACHE_TTL_SECONDS", defaults.cache.ttl_seconds),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig {
                url: "sqlite://data/notifications.db".to_string(),
                max_connections: 5,
            },
            retry: RetryConfig {
                enabled: true,
                max_retries: 5,
                base_delay_minutes: 5,
                max_delay_minutes: 1440,
                multiplier: 2.0,
                jitter_ratio: 0.2,
                poll_interval_seconds: 30,
                batch_size: 50,
                worker_concurrency: 10,
                claim_timeout_seconds: 600,
            },
            dedup: DedupConfig {
                session: DedupWindow {
                    window_minutes: 60,
                    max_occurrences: 1,
                },
                campaign: DedupWindow {
                    window_minutes: 1440,
                    max_occurrences: 1,
                },
                content: DedupWindow {
                    window_minutes: 720,
                    max_occurrences: 2,
                },
                time_based: DedupWindow {
                    window_minutes: 2880,
                    max_occurrences: 1,
                },
                trigger_profiles: default_trigger_profiles(),
                sweep_interval_seconds: 3600,
            },
            delivery: DeliveryConfig {
                webhook_url: None,
                timeout_seconds: 10,
            },
            cache: CacheConfig { ttl_seconds: 300 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dedup_profiles_match_policy() {
        let cfg = Config::default();
        assert_eq!(cfg.dedup.window(DedupProfile::Session).window_minutes, 60);
        assert_eq!(cfg.dedup.window(DedupProfile::Session).max_occurrences, 1);
        assert_eq!(cfg.dedup.window(DedupProfile::Campaign).window_minutes, 1440);
        assert_eq!(cfg.dedup.window(DedupProfile::Content).window_minutes, 720);
        assert_eq!(cfg.dedup.window(DedupProfile::Content).max_occurrences, 2);
        assert_eq!(cfg.dedup.window(DedupProfile::TimeBased).window_minutes, 2880);
    }

    #[test]
    fn unknown_trigger_falls_back_to_session_profile() {
        let cfg = Config::default();
        assert_eq!(
            cfg.dedup.profile_for_trigger("campaign_launch"),
            DedupProfile::Campaign
        );
        assert_eq!(
            cfg.dedup.profile_for_trigger("something_new"),
            DedupProfile::Session
        );
    }

    #[test]
    fn parses_trigger_profile_overrides() {
        let map = parse_trigger_profiles("a=content, b = time_based,").unwrap();
        assert_eq!(map.get("a"), Some(&DedupProfile::Content));
        assert_eq!(map.get("b"), Some(&DedupProfile::TimeBased));

        assert!(parse_trigger_profiles("broken").is_err());
        assert!(parse_trigger_profiles("a=weekly").is_err());
    }

    #[test]
    fn retry_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.base_delay_minutes, 5);
        assert_eq!(cfg.retry.max_delay_minutes, 1440);
        assert_eq!(cfg.retry.multiplier, 2.0);
    }
}
