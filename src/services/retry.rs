//! Delivery worker: claims due notifications, attempts delivery and drives the
//! retry state machine.
//!
//! ```text
//! pending --claim--> processing --success----------------------> sent
//!                               --retryable, below max retries--> pending (retry_count + 1)
//!                               --otherwise-------------------> failed (+ dead-letter entry)
//! pending --cancel--> cancelled
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use sqlx::SqlitePool;

use crate::config::RetryConfig;
use crate::db::{
    CancelFilter, CreateDeliveryAttempt, DeliveryAttemptRepository, FailureReason,
    RetryHistoryEntry, ScheduledNotification, ScheduledNotificationRepository,
};
use crate::error::{AppError, AppResult};
use crate::services::dead_letter::DeadLetterService;
use crate::services::delivery::{DeliveryChannel, DeliveryOutcome};

const RETRYABLE_CODES: &[&str] = &[
    "NETWORK_ERROR",
    "TIMEOUT",
    "SERVER_ERROR",
    "RATE_LIMITED",
    "FCM_UNAVAILABLE",
    "TEMPORARY_FAILURE",
    "500",
    "502",
    "503",
    "504",
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
];

const RETRYABLE_PATTERNS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "server error",
    "rate limit",
    "too many requests",
    "service unavailable",
    "temporarily unavailable",
    "connection reset",
    "connection refused",
    "failed to send",
];

/// Whether a failed attempt is worth retrying. Anything not recognised as
/// transient is treated as permanent.
pub fn is_retryable_error(code: Option<&str>, message: Option<&str>) -> bool {
    if let Some(code) = code {
        let code = code.trim().to_uppercase();
        if RETRYABLE_CODES.contains(&code.as_str()) {
            return true;
        }
    }
    if let Some(message) = message {
        let message = message.to_lowercase();
        if RETRYABLE_PATTERNS.iter().any(|p| message.contains(p)) {
            return true;
        }
    }
    false
}

fn format_error(outcome: &DeliveryOutcome) -> String {
    match (&outcome.error_code, &outcome.error_message) {
        (Some(code), Some(message)) => format!("{}: {}", code, message),
        (Some(code), None) => code.clone(),
        (None, Some(message)) => message.clone(),
        (None, None) => "delivery failed without error details".to_string(),
    }
}

/// Scale `delay_minutes` by a random factor in `[1 - ratio, 1 + ratio]`.
fn apply_jitter(delay_minutes: f64, ratio: f64, rng: &mut impl Rng) -> f64 {
    if ratio <= 0.0 {
        return delay_minutes;
    }
    let factor = 1.0 + ratio * rng.gen_range(-1.0..=1.0);
    delay_minutes * factor
}

/// `min(base * multiplier^retry_count, max)` in minutes, before jitter.
pub fn base_delay_minutes(config: &RetryConfig, retry_count: u32) -> f64 {
    let base = config.base_delay_minutes as f64;
    let max = config.max_delay_minutes as f64;
    let exp = i32::try_from(retry_count).unwrap_or(i32::MAX);
    (base * config.multiplier.powi(exp)).min(max)
}

/// What happened to a single claimed notification.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Sent,
    Retrying {
        retry_count: i32,
        next_retry: DateTime<Utc>,
    },
    DeadLettered(FailureReason),
    /// The row changed state underneath us (cancelled, released) or storage
    /// failed; nothing was committed by this attempt.
    Skipped,
}

/// Counts for one polling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

/// Which pending notifications to cancel.
#[derive(Debug, Clone)]
pub enum CancelRequest {
    Ids(Vec<String>),
    Matching(CancelFilter),
}

pub struct RetryManager {
    pool: SqlitePool,
    channel: Arc<dyn DeliveryChannel>,
    dead_letters: DeadLetterService,
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(pool: SqlitePool, channel: Arc<dyn DeliveryChannel>, config: RetryConfig) -> Self {
        Self {
            dead_letters: DeadLetterService::new(pool.clone()),
            pool,
            channel,
            config,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn base_delay_minutes(&self, retry_count: u32) -> f64 {
        base_delay_minutes(&self.config, retry_count)
    }

    /// Delay before the next attempt after `retry_count` failures so far:
    /// jittered backoff, never below one minute.
    pub fn calculate_next_retry_delay(&self, retry_count: u32) -> Duration {
        let jittered = apply_jitter(
            self.base_delay_minutes(retry_count),
            self.config.jitter_ratio,
            &mut rand::thread_rng(),
        );
        let seconds = (jittered * 60.0).max(60.0).round() as i64;
        Duration::try_seconds(seconds).unwrap_or(Duration::MAX)
    }

    /// Claim one batch of due notifications and process it with bounded
    /// concurrency.
    pub async fn process_due(&self) -> AppResult<ProcessSummary> {
        let claimed = ScheduledNotificationRepository::fetch_and_claim_due(
            &self.pool,
            i64::from(self.config.batch_size),
            Utc::now(),
        )
        .await?;

        let mut summary = ProcessSummary {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            tracing::debug!("No due notifications");
            return Ok(summary);
        }
        tracing::debug!("Claimed {} due notification(s)", claimed.len());

        let concurrency = self.config.worker_concurrency.max(1) as usize;
        let results: Vec<AttemptResult> = stream::iter(claimed)
            .map(|notification| self.process_notification(notification))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                AttemptResult::Sent => summary.sent += 1,
                AttemptResult::Retrying { .. } => summary.retried += 1,
                AttemptResult::DeadLettered(_) => summary.dead_lettered += 1,
                AttemptResult::Skipped => summary.skipped += 1,
            }
        }
        tracing::info!(
            "Delivery pass: {} sent, {} retrying, {} dead-lettered, {} skipped",
            summary.sent,
            summary.retried,
            summary.dead_lettered,
            summary.skipped
        );
        Ok(summary)
    }

    /// Attempt delivery of a claimed (`processing`) notification and commit
    /// the outcome. Errors are logged, never returned, so one notification
    /// cannot fail the batch.
    pub async fn process_notification(&self, notification: ScheduledNotification) -> AttemptResult {
        let outcome = self.channel.send(&notification).await;
        self.log_attempt(&notification, &outcome).await;

        match self.handle_outcome(&notification, &outcome).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    notification_id = %notification.id,
                    error_code = e.code(),
                    "Failed to record delivery outcome: {}",
                    e
                );
                AttemptResult::Skipped
            }
        }
    }

    async fn handle_outcome(
        &self,
        notification: &ScheduledNotification,
        outcome: &DeliveryOutcome,
    ) -> AppResult<AttemptResult> {
        if outcome.success {
            return match ScheduledNotificationRepository::mark_sent(&self.pool, &notification.id)
                .await?
            {
                Some(_) => {
                    tracing::info!(
                        "Notification {} delivered to user {}",
                        notification.id,
                        notification.user_id
                    );
                    Ok(AttemptResult::Sent)
                }
                None => {
                    tracing::warn!(
                        "Notification {} delivered but was no longer claimed",
                        notification.id
                    );
                    Ok(AttemptResult::Skipped)
                }
            };
        }

        let now = Utc::now();
        let retryable = is_retryable_error(
            outcome.error_code.as_deref(),
            outcome.error_message.as_deref(),
        );
        let failures = notification.retry_count + 1;
        let last_error = format_error(outcome);

        let mut metadata = notification.metadata();
        metadata.retry_history.push(RetryHistoryEntry {
            attempt: failures,
            attempted_at: now,
            error_code: outcome.error_code.clone(),
            error_message: outcome.error_message.clone(),
            retryable,
        });

        let exhausted = notification.retry_count >= self.config.max_retries as i32;
        if !retryable || exhausted {
            let reason = if retryable {
                FailureReason::MaxRetriesExceeded
            } else {
                FailureReason::NonRetryableError
            };
            let entry = self
                .dead_letters
                .move_to_dead_letter_queue(notification, failures, Some(&last_error), reason, metadata)
                .await?;
            return Ok(match entry {
                Some(_) => AttemptResult::DeadLettered(reason),
                None => AttemptResult::Skipped,
            });
        }

        let delay = self.calculate_next_retry_delay(notification.retry_count.max(0) as u32);
        let next_retry = now.checked_add_signed(delay).ok_or_else(|| {
            AppError::Config(format!("retry delay of {}s is out of range", delay.num_seconds()))
        })?;
        let metadata_json = serde_json::to_string(&metadata)?;
        let updated = ScheduledNotificationRepository::schedule_retry(
            &self.pool,
            &notification.id,
            failures,
            next_retry,
            Some(last_error.clone()),
            &metadata_json,
        )
        .await?;

        match updated {
            Some(_) => {
                tracing::info!(
                    "Notification {} failed ({}), retry {} at {}",
                    notification.id,
                    last_error,
                    failures,
                    next_retry
                );
                Ok(AttemptResult::Retrying {
                    retry_count: failures,
                    next_retry,
                })
            }
            None => {
                tracing::warn!(
                    "Notification {} was no longer claimed, retry not scheduled",
                    notification.id
                );
                Ok(AttemptResult::Skipped)
            }
        }
    }

    async fn log_attempt(&self, notification: &ScheduledNotification, outcome: &DeliveryOutcome) {
        let attempt = CreateDeliveryAttempt {
            notification_id: notification.id.clone(),
            attempt_number: notification.retry_count + 1,
            success: outcome.success,
            error_code: outcome.error_code.clone(),
            error_message: outcome.error_message.clone(),
        };
        if let Err(e) = DeliveryAttemptRepository::create(&self.pool, attempt).await {
            tracing::debug!(
                "Could not log delivery attempt for {}: {}",
                notification.id,
                e
            );
        }
    }

    /// Cancel pending notifications. Rows that are already terminal or being
    /// delivered are left alone. Returns how many were cancelled.
    pub async fn cancel_scheduled_notifications(&self, request: &CancelRequest) -> AppResult<u64> {
        let cancelled = match request {
            CancelRequest::Ids(ids) => {
                ScheduledNotificationRepository::cancel_by_ids(&self.pool, ids).await?
            }
            CancelRequest::Matching(filter) => {
                ScheduledNotificationRepository::cancel_matching(&self.pool, filter).await?
            }
        };
        if cancelled > 0 {
            tracing::info!("Cancelled {} pending notification(s)", cancelled);
        }
        Ok(cancelled)
    }

    /// Return rows stuck in `processing` past the claim timeout to `pending`.
    pub async fn release_stale_claims(&self) -> AppResult<u64> {
        let cutoff = i64::try_from(self.config.claim_timeout_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|timeout| Utc::now().checked_sub_signed(timeout));
        // A timeout reaching past the earliest timestamp never expires a claim.
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };
        let released =
            ScheduledNotificationRepository::release_stale_claims(&self.pool, cutoff).await?;
        if released > 0 {
            tracing::warn!("Released {} stale delivery claim(s)", released);
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::test_pool;
    use crate::db::{
        CreateScheduledNotification, DeadLetterRepository, NotificationMetadata, NotificationStatus,
    };
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedChannel {
        outcome: DeliveryOutcome,
        calls: AtomicUsize,
    }

    impl ScriptedChannel {
        fn new(outcome: DeliveryOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DeliveryChannel for ScriptedChannel {
        async fn send(&self, _notification: &ScheduledNotification) -> DeliveryOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn manager(pool: &SqlitePool, channel: Arc<ScriptedChannel>) -> RetryManager {
        RetryManager::new(pool.clone(), channel, Config::default().retry)
    }

    async fn pending(pool: &SqlitePool) -> ScheduledNotification {
        ScheduledNotificationRepository::create(
            pool,
            CreateScheduledNotification {
                rule_id: "r1".to_string(),
                user_id: "u1".to_string(),
                session_id: Some("s1".to_string()),
                campaign_id: None,
                scheduled_for: Utc::now() - Duration::minutes(1),
                metadata: NotificationMetadata::default(),
            },
        )
        .await
        .unwrap()
    }

    /// A claimed notification that has already failed `retry_count` times.
    async fn claimed_with_retries(pool: &SqlitePool, retry_count: i32) -> ScheduledNotification {
        let n = pending(pool).await;
        assert!(ScheduledNotificationRepository::claim(pool, &n.id).await.unwrap());
        if retry_count > 0 {
            ScheduledNotificationRepository::schedule_retry(
                pool,
                &n.id,
                retry_count,
                Utc::now() - Duration::seconds(1),
                Some("TIMEOUT".to_string()),
                "{}",
            )
            .await
            .unwrap()
            .unwrap();
            assert!(ScheduledNotificationRepository::claim(pool, &n.id).await.unwrap());
        }
        ScheduledNotificationRepository::find_by_id(pool, &n.id)
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let cfg = Config::default().retry;
        let delays: Vec<f64> = (0..5).map(|n| base_delay_minutes(&cfg, n)).collect();
        assert_eq!(delays, vec![5.0, 10.0, 20.0, 40.0, 80.0]);
        assert_eq!(base_delay_minutes(&cfg, 9), 1440.0);
        assert_eq!(base_delay_minutes(&cfg, 40), 1440.0);
    }

    #[tokio::test]
    async fn oversized_delay_and_timeout_settings_do_not_panic() {
        let pool = test_pool().await;
        let mut cfg = Config::default().retry;
        cfg.base_delay_minutes = u64::MAX;
        cfg.max_delay_minutes = u64::MAX;
        cfg.claim_timeout_seconds = u64::MAX;
        let manager = RetryManager::new(
            pool.clone(),
            ScriptedChannel::new(DeliveryOutcome::failed("TIMEOUT", "timed out")),
            cfg,
        );

        assert_eq!(manager.calculate_next_retry_delay(3), Duration::MAX);
        assert_eq!(manager.release_stale_claims().await.unwrap(), 0);

        let n = claimed_with_retries(&pool, 0).await;
        assert_eq!(manager.process_notification(n).await, AttemptResult::Skipped);
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let d = apply_jitter(20.0, 0.2, &mut rng);
            assert!((16.0..=24.0).contains(&d), "{d}");
        }
        assert_eq!(apply_jitter(20.0, 0.0, &mut rng), 20.0);
    }

    #[test]
    fn retryable_classification() {
        assert!(is_retryable_error(Some("RATE_LIMITED"), None));
        assert!(is_retryable_error(Some("503"), Some("Service Unavailable")));
        assert!(is_retryable_error(Some("econnreset"), None));
        assert!(is_retryable_error(None, Some("upstream connection reset by peer")));
        assert!(is_retryable_error(Some("HTTP_400"), Some("request timed out")));

        assert!(!is_retryable_error(Some("INVALID_TOKEN"), Some("authentication failed")));
        assert!(!is_retryable_error(Some("HTTP_404"), Some("404 Not Found")));
        assert!(!is_retryable_error(None, None));
    }

    #[tokio::test]
    async fn success_marks_sent_and_logs_attempt() {
        let pool = test_pool().await;
        let channel = ScriptedChannel::new(DeliveryOutcome::delivered());
        let m = manager(&pool, channel.clone());
        let n = claimed_with_retries(&pool, 0).await;

        assert_eq!(m.process_notification(n.clone()).await, AttemptResult::Sent);
        let stored = ScheduledNotificationRepository::find_by_id(&pool, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert!(stored.sent_at.is_some());

        let attempts = DeliveryAttemptRepository::list_for_notification(&pool, &n.id)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].success);
        assert_eq!(attempts[0].attempt_number, 1);
    }

    #[tokio::test]
    async fn rate_limited_failure_schedules_jittered_retry() {
        let pool = test_pool().await;
        let m = manager(
            &pool,
            ScriptedChannel::new(DeliveryOutcome::failed("RATE_LIMITED", "429 Too Many Requests")),
        );
        let n = claimed_with_retries(&pool, 2).await;

        let before = Utc::now();
        let result = m.process_notification(n.clone()).await;
        let after = Utc::now();
        assert!(matches!(result, AttemptResult::Retrying { retry_count: 3, .. }));

        let stored = ScheduledNotificationRepository::find_by_id(&pool, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, NotificationStatus::Pending);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.scheduled_for, n.scheduled_for);
        let next = stored.next_retry.unwrap();
        assert!(next >= before + Duration::minutes(16));
        assert!(next <= after + Duration::minutes(24));

        let metadata = stored.metadata();
        assert_eq!(metadata.retry_history.len(), 1);
        assert_eq!(metadata.retry_history[0].attempt, 3);
        assert!(metadata.retry_history[0].retryable);
    }

    #[tokio::test]
    async fn failure_at_max_retries_dead_letters() {
        let pool = test_pool().await;
        let m = manager(
            &pool,
            ScriptedChannel::new(DeliveryOutcome::failed("TIMEOUT", "delivery timed out")),
        );
        let n = claimed_with_retries(&pool, 5).await;

        assert_eq!(
            m.process_notification(n.clone()).await,
            AttemptResult::DeadLettered(FailureReason::MaxRetriesExceeded)
        );
        let stored = ScheduledNotificationRepository::find_by_id(&pool, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);

        let entries = DeadLetterRepository::list(&pool, Some("u1"), false, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_attempts, 6);
        assert_eq!(entries[0].failure_reason, FailureReason::MaxRetriesExceeded);
    }

    #[tokio::test]
    async fn non_retryable_error_dead_letters_immediately() {
        let pool = test_pool().await;
        let m = manager(
            &pool,
            ScriptedChannel::new(DeliveryOutcome::failed("INVALID_TOKEN", "authentication failed")),
        );
        let n = claimed_with_retries(&pool, 0).await;

        assert_eq!(
            m.process_notification(n.clone()).await,
            AttemptResult::DeadLettered(FailureReason::NonRetryableError)
        );
        let entries = DeadLetterRepository::list(&pool, None, false, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].original_notification_id, n.id);
        let history = entries[0].metadata().retry_history;
        assert_eq!(history.len(), 1);
        assert!(!history[0].retryable);
        assert_eq!(
            entries[0].last_error.as_deref(),
            Some("INVALID_TOKEN: authentication failed")
        );
    }

    #[tokio::test]
    async fn process_due_handles_whole_batch() {
        let pool = test_pool().await;
        let channel = ScriptedChannel::new(DeliveryOutcome::delivered());
        let m = manager(&pool, channel.clone());
        for _ in 0..3 {
            pending(&pool).await;
        }
        ScheduledNotificationRepository::create(
            &pool,
            CreateScheduledNotification {
                rule_id: "r1".to_string(),
                user_id: "u1".to_string(),
                session_id: None,
                campaign_id: None,
                scheduled_for: Utc::now() + Duration::hours(2),
                metadata: NotificationMetadata::default(),
            },
        )
        .await
        .unwrap();

        let summary = m.process_due().await.unwrap();
        assert_eq!(summary.claimed, 3);
        assert_eq!(summary.sent, 3);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);

        let again = m.process_due().await.unwrap();
        assert_eq!(again, ProcessSummary::default());
    }

    #[tokio::test]
    async fn cancel_is_noop_after_delivery() {
        let pool = test_pool().await;
        let m = manager(&pool, ScriptedChannel::new(DeliveryOutcome::delivered()));
        let waiting = pending(&pool).await;
        let delivered = claimed_with_retries(&pool, 0).await;
        m.process_notification(delivered.clone()).await;

        let cancelled = m
            .cancel_scheduled_notifications(&CancelRequest::Ids(vec![
                waiting.id.clone(),
                delivered.id.clone(),
            ]))
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        let stored = ScheduledNotificationRepository::find_by_id(&pool, &delivered.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);

        let again = m
            .cancel_scheduled_notifications(&CancelRequest::Matching(CancelFilter {
                user_id: "u1".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn outcome_for_cancelled_row_is_skipped() {
        let pool = test_pool().await;
        let m = manager(
            &pool,
            ScriptedChannel::new(DeliveryOutcome::failed("TIMEOUT", "timed out")),
        );
        let n = claimed_with_retries(&pool, 0).await;
        // Simulate the claim being released and the row cancelled meanwhile.
        ScheduledNotificationRepository::release_stale_claims(&pool, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        ScheduledNotificationRepository::cancel_by_ids(&pool, &[n.id.clone()])
            .await
            .unwrap();

        assert_eq!(m.process_notification(n).await, AttemptResult::Skipped);
    }
}
