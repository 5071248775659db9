//! Notification ledger.
//!
//! The durable record of every notification's lifecycle and the in-app
//! inbox. Every transition targets exactly one row, so no multi-row
//! transactions are needed; guarded `UPDATE`s make transitions idempotent.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::events::{EventType, NotificationPriority};
use super::types::NotificationRequest;
use crate::database::models::{
    Channel, DeliveryAttempt, DeliveryStats, NotificationDbModel, NotificationStatus, Paginated,
    Pagination,
};
use crate::database::repositories::{NotificationFilter, NotificationRepository};
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::{Error, Result};

/// Decoded view of a ledger row.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub id: String,
    pub user_id: String,
    pub event_type: String,
    pub channel: String,
    pub title: String,
    pub message: String,
    pub status: String,
    pub priority: NotificationPriority,
    pub metadata: Map<String, Value>,
    pub retry_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivery_attempts: Vec<DeliveryAttempt>,
    pub last_error: Option<String>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&NotificationDbModel> for NotificationRecord {
    fn from(row: &NotificationDbModel) -> Self {
        Self {
            id: row.id.clone(),
            user_id: row.user_id.clone(),
            event_type: row.event_type.clone(),
            channel: row.channel.clone(),
            title: row.title.clone(),
            message: row.message.clone(),
            status: row.status.clone(),
            priority: row.priority(),
            metadata: row.metadata_map(),
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at(),
            delivery_attempts: row.attempts(),
            last_error: row.last_error.clone(),
            is_read: row.is_read,
            read_at: row.read_at.map(ms_to_datetime),
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
        }
    }
}

/// Rebuild the request a ledger row was created from.
///
/// Content is the already-rendered title and message.
pub fn request_from_record(row: &NotificationDbModel) -> Result<NotificationRequest> {
    let event_type = row.event_type().ok_or_else(|| {
        Error::validation(format!("unknown event type '{}' on {}", row.event_type, row.id))
    })?;
    let mut request = NotificationRequest::new(row.user_id.clone(), event_type)
        .with_content(row.title.clone(), row.message.clone())
        .with_priority(row.priority())
        .with_metadata(row.metadata_map());
    request.channel = row.channel();
    request.bypass_batching = true;
    Ok(request)
}

pub struct NotificationLedger {
    repo: Arc<dyn NotificationRepository>,
}

impl NotificationLedger {
    pub fn new(repo: Arc<dyn NotificationRepository>) -> Self {
        Self { repo }
    }

    pub async fn create(&self, notification: &NotificationDbModel) -> Result<()> {
        self.repo.create(notification).await?;
        debug!(
            notification_id = %notification.id,
            user_id = %notification.user_id,
            channel = %notification.channel,
            "Recorded pending notification"
        );
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<NotificationDbModel> {
        self.repo.get(id).await
    }

    pub async fn mark_sent(
        &self,
        id: &str,
        channel: Channel,
        attempt: &DeliveryAttempt,
    ) -> Result<bool> {
        self.repo.mark_sent(id, channel, attempt).await
    }

    pub async fn mark_failed(
        &self,
        id: &str,
        attempt: &DeliveryAttempt,
        retry_count: u32,
        next_retry_at: Option<i64>,
    ) -> Result<bool> {
        self.repo
            .mark_failed(id, attempt, retry_count, next_retry_at)
            .await
    }

    pub async fn mark_dead_lettered(&self, id: &str, reason: &str) -> Result<bool> {
        self.repo.mark_dead_lettered(id, reason).await
    }

    pub async fn append_attempt(&self, id: &str, attempt: &DeliveryAttempt) -> Result<bool> {
        self.repo.append_attempt(id, attempt).await
    }

    pub async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        max_retries: u32,
        limit: u32,
    ) -> Result<Vec<NotificationDbModel>> {
        self.repo
            .list_due_for_retry(datetime_to_ms(now), max_retries, limit)
            .await
    }

    pub async fn list_for_user(
        &self,
        user_id: &str,
        filter: &NotificationFilter,
    ) -> Result<Paginated<NotificationRecord>> {
        let page = self.repo.list_for_user(user_id, filter).await?;
        Ok(Paginated {
            items: page.items.iter().map(NotificationRecord::from).collect(),
            total: page.total,
            page: page.page,
            limit: page.limit,
        })
    }

    /// A user's own notification.
    pub async fn get_for_user(&self, id: &str, user_id: &str) -> Result<NotificationRecord> {
        let row = self.repo.get(id).await?;
        if row.user_id != user_id {
            return Err(Error::not_found("Notification", id));
        }
        Ok(NotificationRecord::from(&row))
    }

    /// Mark one notification read. Already-read notifications are left as is.
    pub async fn mark_read(&self, id: &str, user_id: &str) -> Result<()> {
        if !self.repo.mark_read(id, user_id).await? {
            // Distinguish "already read" from "not yours / missing".
            self.get_for_user(id, user_id).await?;
        }
        Ok(())
    }

    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        self.repo.mark_all_read(user_id).await
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<i64> {
        self.repo.unread_count(user_id).await
    }

    pub async fn delete(&self, id: &str, user_id: &str) -> Result<()> {
        if !self.repo.delete(id, user_id).await? {
            return Err(Error::not_found("Notification", id));
        }
        Ok(())
    }

    /// Statistics for `[from, to)`, optionally for one user.
    pub async fn delivery_stats(
        &self,
        user_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<DeliveryStats> {
        if from >= to {
            return Err(Error::validation("stats range start must precede its end"));
        }
        self.repo
            .delivery_stats(user_id, datetime_to_ms(from), datetime_to_ms(to))
            .await
    }
}

/// Filter helper for callers that only know string names.
pub fn build_filter(
    status: Option<&str>,
    event_type: Option<&str>,
    unread_only: bool,
    page: u32,
    limit: u32,
) -> Result<NotificationFilter> {
    let status = status
        .map(|s| {
            NotificationStatus::parse(s)
                .ok_or_else(|| Error::validation(format!("unknown status '{s}'")))
        })
        .transpose()?;
    let event_type = event_type
        .map(|e| {
            EventType::parse(e).ok_or_else(|| Error::validation(format!("unknown event type '{e}'")))
        })
        .transpose()?;
    Ok(NotificationFilter {
        status,
        event_type,
        unread_only,
        pagination: Pagination::new(page, limit),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter() {
        let filter = build_filter(Some("failed"), Some("FileUploaded"), true, 0, 500).unwrap();
        assert_eq!(filter.status, Some(NotificationStatus::Failed));
        assert_eq!(filter.event_type, Some(EventType::FileUploaded));
        assert_eq!(filter.pagination.page, 1);
        assert_eq!(filter.pagination.limit, 100);

        assert!(build_filter(Some("lost"), None, false, 1, 20).is_err());
        assert!(build_filter(None, Some("nope"), false, 1, 20).is_err());
    }

    #[test]
    fn test_request_from_record() {
        let mut metadata = Map::new();
        metadata.insert("file_name".into(), Value::from("a.txt"));
        let row = NotificationDbModel::new(
            "u",
            EventType::FileDeleted,
            Channel::Push,
            "File deleted",
            "a.txt was deleted.",
            NotificationPriority::High,
            &metadata,
        );

        let request = request_from_record(&row).unwrap();
        assert_eq!(request.channel, Some(Channel::Push));
        assert_eq!(request.priority, NotificationPriority::High);
        assert_eq!(request.title, "File deleted");
        assert_eq!(request.metadata["file_name"], "a.txt");
        assert!(request.bypass_batching);
    }
}
