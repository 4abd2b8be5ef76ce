use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::{
    CreateDeadLetter, CreateScheduledNotification, DeadLetterMetadata, DeadLetterNotification,
    DeadLetterRepository, FailureReason, NotificationMetadata, ScheduledNotification,
    ScheduledNotificationRepository,
};
use crate::error::{AppError, AppResult};

/// Terminal failures and their manual recovery.
#[derive(Clone)]
pub struct DeadLetterService {
    pool: SqlitePool,
}

impl DeadLetterService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mark `notification` failed and record it in the dead-letter queue, in
    /// one transaction. `metadata` must already hold the full retry history.
    ///
    /// Returns `None` when the notification had already reached a terminal
    /// state (for example it was cancelled in the meantime).
    pub async fn move_to_dead_letter_queue(
        &self,
        notification: &ScheduledNotification,
        retry_count: i32,
        last_error: Option<&str>,
        reason: FailureReason,
        metadata: NotificationMetadata,
    ) -> AppResult<Option<DeadLetterNotification>> {
        let metadata_json = serde_json::to_string(&metadata)?;
        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

        let marked = ScheduledNotificationRepository::mark_failed(
            &mut *tx,
            &notification.id,
            retry_count,
            last_error,
            &metadata_json,
        )
        .await?;
        if !marked {
            tracing::debug!(
                "Notification {} already terminal, not dead-lettering",
                notification.id
            );
            return Ok(None);
        }

        let entry = DeadLetterRepository::create(
            &mut *tx,
            CreateDeadLetter {
                original_notification_id: notification.id.clone(),
                user_id: notification.user_id.clone(),
                rule_id: notification.rule_id.clone(),
                template_id: metadata.template_id.clone(),
                failure_reason: reason,
                retry_attempts: retry_count,
                last_error: last_error.map(str::to_string),
                metadata: DeadLetterMetadata {
                    retry_history: metadata.retry_history.clone(),
                    session_id: notification.session_id.clone(),
                    campaign_id: notification.campaign_id.clone(),
                    original_scheduled_for: Some(notification.scheduled_for),
                    notification: metadata,
                },
            },
        )
        .await?;

        tx.commit().await.map_err(AppError::Database)?;

        tracing::warn!(
            "Notification {} moved to dead-letter queue ({}) after {} attempt(s): {}",
            notification.id,
            reason.as_str(),
            retry_count,
            last_error.unwrap_or("unknown error")
        );
        Ok(Some(entry))
    }

    /// Spawn a fresh pending notification for each dead-letter entry, due now.
    ///
    /// Entries that are missing or already requeued are skipped, so calling
    /// this twice with the same ids only requeues once. The entries themselves
    /// are kept.
    pub async fn requeue_from_dead_letter(
        &self,
        ids: &[String],
    ) -> AppResult<Vec<ScheduledNotification>> {
        let mut requeued = Vec::new();
        for id in ids {
            match self.requeue_one(id).await {
                Ok(Some(notification)) => requeued.push(notification),
                Ok(None) => {}
                Err(e) => tracing::error!("Failed to requeue dead-letter entry {}: {}", id, e),
            }
        }
        Ok(requeued)
    }

    async fn requeue_one(&self, id: &str) -> AppResult<Option<ScheduledNotification>> {
        let Some(entry) = DeadLetterRepository::find_by_id(&self.pool, id).await? else {
            tracing::warn!("Dead-letter entry {} not found", id);
            return Ok(None);
        };
        if entry.requeued {
            tracing::info!("Dead-letter entry {} was already requeued", id);
            return Ok(None);
        }

        let stored = entry.metadata();
        let mut metadata = stored.notification;
        metadata.retry_history.clear();
        metadata.requeued_from = Some(entry.id.clone());

        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;
        let notification = ScheduledNotificationRepository::create(
            &mut *tx,
            CreateScheduledNotification {
                rule_id: entry.rule_id.clone(),
                user_id: entry.user_id.clone(),
                session_id: stored.session_id,
                campaign_id: stored.campaign_id,
                scheduled_for: Utc::now(),
                metadata,
            },
        )
        .await?;

        // Lost a race with another requeue of the same entry.
        if !DeadLetterRepository::mark_requeued(&mut *tx, &entry.id, &notification.id).await? {
            return Ok(None);
        }
        tx.commit().await.map_err(AppError::Database)?;

        tracing::info!(
            "Requeued dead-letter entry {} as notification {}",
            entry.id,
            notification.id
        );
        Ok(Some(notification))
    }

    pub async fn list(
        &self,
        user_id: Option<&str>,
        include_requeued: bool,
        limit: i64,
    ) -> AppResult<Vec<DeadLetterNotification>> {
        DeadLetterRepository::list(&self.pool, user_id, include_requeued, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::db::{NotificationStatus, RetryHistoryEntry};

    async fn failed_notification(pool: &SqlitePool) -> (ScheduledNotification, DeadLetterNotification) {
        let notification = ScheduledNotificationRepository::create(
            pool,
            CreateScheduledNotification {
                rule_id: "r1".to_string(),
                user_id: "u1".to_string(),
                session_id: Some("s1".to_string()),
                campaign_id: None,
                scheduled_for: Utc::now(),
                metadata: NotificationMetadata {
                    template_id: Some("tpl".to_string()),
                    ..Default::default()
                },
            },
        )
        .await
        .unwrap();

        let metadata = NotificationMetadata {
            template_id: Some("tpl".to_string()),
            retry_history: vec![RetryHistoryEntry {
                attempt: 1,
                attempted_at: Utc::now(),
                error_code: Some("INVALID_TOKEN".to_string()),
                error_message: Some("authentication failed".to_string()),
                retryable: false,
            }],
            ..Default::default()
        };
        let entry = DeadLetterService::new(pool.clone())
            .move_to_dead_letter_queue(
                &notification,
                0,
                Some("INVALID_TOKEN: authentication failed"),
                FailureReason::NonRetryableError,
                metadata,
            )
            .await
            .unwrap()
            .unwrap();
        (notification, entry)
    }

    #[tokio::test]
    async fn dead_lettering_marks_original_failed_and_keeps_history() {
        let pool = test_pool().await;
        let (notification, entry) = failed_notification(&pool).await;

        let original = ScheduledNotificationRepository::find_by_id(&pool, &notification.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original.status, NotificationStatus::Failed);

        assert_eq!(entry.original_notification_id, notification.id);
        assert_eq!(entry.template_id.as_deref(), Some("tpl"));
        assert_eq!(entry.failure_reason, FailureReason::NonRetryableError);
        let metadata = entry.metadata();
        assert_eq!(metadata.retry_history.len(), 1);
        assert_eq!(metadata.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn terminal_notification_is_not_dead_lettered_twice() {
        let pool = test_pool().await;
        let (notification, _) = failed_notification(&pool).await;
        let again = DeadLetterService::new(pool.clone())
            .move_to_dead_letter_queue(
                &notification,
                0,
                None,
                FailureReason::NonRetryableError,
                NotificationMetadata::default(),
            )
            .await
            .unwrap();
        assert!(again.is_none());
        let all = DeadLetterService::new(pool).list(None, true, 10).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn requeue_spawns_fresh_notification_once() {
        let pool = test_pool().await;
        let (_, entry) = failed_notification(&pool).await;
        let service = DeadLetterService::new(pool.clone());

        let requeued = service
            .requeue_from_dead_letter(&[entry.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(requeued.len(), 1);
        let fresh = &requeued[0];
        assert_eq!(fresh.status, NotificationStatus::Pending);
        assert_eq!(fresh.retry_count, 0);
        assert_eq!(fresh.session_id.as_deref(), Some("s1"));
        let metadata = fresh.metadata();
        assert_eq!(metadata.requeued_from.as_deref(), Some(entry.id.as_str()));
        assert!(metadata.retry_history.is_empty());

        let again = service
            .requeue_from_dead_letter(&[entry.id.clone()])
            .await
            .unwrap();
        assert!(again.is_empty());

        // The entry stays as an audit record.
        let stored = DeadLetterRepository::find_by_id(&pool, &entry.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.requeued);
        assert_eq!(stored.requeued_notification_id.as_deref(), Some(fresh.id.as_str()));
        assert!(service.list(Some("u1"), false, 10).await.unwrap().is_empty());
        assert_eq!(service.list(Some("u1"), true, 10).await.unwrap().len(), 1);
    }
}
