//! Notification ledger repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::database::models::{
    Channel, ChannelDeliveryStats, DeliveryAttempt, DeliveryStats, NotificationDbModel,
    NotificationStatus, Paginated, Pagination,
};
use crate::database::time::now_ms;
use crate::notification::events::EventType;
use crate::{Error, Result};

/// Filters for listing a user's notifications.
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub status: Option<NotificationStatus>,
    pub event_type: Option<EventType>,
    pub unread_only: bool,
    pub pagination: Pagination,
}

/// Notification ledger repository trait.
///
/// Status transitions return `false` when the guard in the `WHERE` clause
/// rejected them (row missing or already in a terminal state).
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create(&self, notification: &NotificationDbModel) -> Result<()>;
    async fn get(&self, id: &str) -> Result<NotificationDbModel>;

    // Status transitions
    async fn mark_sent(&self, id: &str, channel: Channel, attempt: &DeliveryAttempt)
    -> Result<bool>;
    async fn mark_failed(
        &self,
        id: &str,
        attempt: &DeliveryAttempt,
        retry_count: u32,
        next_retry_at: Option<i64>,
    ) -> Result<bool>;
    async fn mark_dead_lettered(&self, id: &str, reason: &str) -> Result<bool>;
    /// Record a failed attempt without changing status.
    async fn append_attempt(&self, id: &str, attempt: &DeliveryAttempt) -> Result<bool>;
    async fn list_due_for_retry(
        &self,
        now_ms: i64,
        max_retries: u32,
        limit: u32,
    ) -> Result<Vec<NotificationDbModel>>;

    // Inbox
    async fn list_for_user(
        &self,
        user_id: &str,
        filter: &NotificationFilter,
    ) -> Result<Paginated<NotificationDbModel>>;
    async fn mark_read(&self, id: &str, user_id: &str) -> Result<bool>;
    async fn mark_all_read(&self, user_id: &str) -> Result<u64>;
    async fn unread_count(&self, user_id: &str) -> Result<i64>;
    async fn delete(&self, id: &str, user_id: &str) -> Result<bool>;

    // Reporting
    async fn delivery_stats(
        &self,
        user_id: Option<&str>,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<DeliveryStats>;
}

/// SQLx implementation of NotificationRepository.
pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn push_user_filters<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    user_id: &'a str,
    filter: &'a NotificationFilter,
) {
    builder.push(" WHERE user_id = ").push_bind(user_id);
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(event_type) = filter.event_type {
        builder.push(" AND event_type = ").push_bind(event_type.as_str());
    }
    if filter.unread_only {
        builder.push(" AND is_read = 0");
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn create(&self, notification: &NotificationDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification (
                id, user_id, event_type, channel, title, message, status, priority,
                metadata, retry_count, next_retry_at, delivery_attempts, last_error,
                is_read, read_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.user_id)
        .bind(&notification.event_type)
        .bind(&notification.channel)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.status)
        .bind(&notification.priority)
        .bind(&notification.metadata)
        .bind(notification.retry_count)
        .bind(notification.next_retry_at)
        .bind(&notification.delivery_attempts)
        .bind(&notification.last_error)
        .bind(notification.is_read)
        .bind(notification.read_at)
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<NotificationDbModel> {
        sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notification WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Notification", id))
    }

    async fn mark_sent(
        &self,
        id: &str,
        channel: Channel,
        attempt: &DeliveryAttempt,
    ) -> Result<bool> {
        let attempt_json = serde_json::to_string(attempt)?;
        let result = sqlx::query(
            r#"
            UPDATE notification SET
                status = 'sent',
                channel = ?,
                next_retry_at = NULL,
                last_error = NULL,
                delivery_attempts = json_insert(delivery_attempts, '$[#]', json(?)),
                updated_at = ?
            WHERE id = ? AND status != 'sent'
            "#,
        )
        .bind(channel.as_str())
        .bind(attempt_json)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        id: &str,
        attempt: &DeliveryAttempt,
        retry_count: u32,
        next_retry_at: Option<i64>,
    ) -> Result<bool> {
        let attempt_json = serde_json::to_string(attempt)?;
        let result = sqlx::query(
            r#"
            UPDATE notification SET
                status = 'failed',
                retry_count = ?,
                next_retry_at = ?,
                last_error = ?,
                delivery_attempts = json_insert(delivery_attempts, '$[#]', json(?)),
                updated_at = ?
            WHERE id = ? AND status IN ('pending', 'failed')
            "#,
        )
        .bind(i64::from(retry_count))
        .bind(next_retry_at)
        .bind(&attempt.error)
        .bind(attempt_json)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_dead_lettered(&self, id: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notification SET
                status = 'dead_lettered',
                next_retry_at = NULL,
                last_error = ?,
                updated_at = ?
            WHERE id = ? AND status IN ('pending', 'failed')
            "#,
        )
        .bind(reason)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_attempt(&self, id: &str, attempt: &DeliveryAttempt) -> Result<bool> {
        let attempt_json = serde_json::to_string(attempt)?;
        let result = sqlx::query(
            r#"
            UPDATE notification SET
                delivery_attempts = json_insert(delivery_attempts, '$[#]', json(?)),
                last_error = COALESCE(?, last_error),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(attempt_json)
        .bind(&attempt.error)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_due_for_retry(
        &self,
        now_ms: i64,
        max_retries: u32,
        limit: u32,
    ) -> Result<Vec<NotificationDbModel>> {
        let rows = sqlx::query_as::<_, NotificationDbModel>(
            r#"
            SELECT * FROM notification
            WHERE status = 'failed'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= ?
              AND retry_count <= ?
            ORDER BY next_retry_at ASC
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(i64::from(max_retries))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        filter: &NotificationFilter,
    ) -> Result<Paginated<NotificationDbModel>> {
        let pagination = filter.pagination.normalized();

        let mut count_query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM notification");
        push_user_filters(&mut count_query, user_id, filter);
        let (total,): (i64,) = count_query.build_query_as().fetch_one(&self.pool).await?;

        let mut list_query = QueryBuilder::<Sqlite>::new("SELECT * FROM notification");
        push_user_filters(&mut list_query, user_id, filter);
        list_query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(pagination.limit))
            .push(" OFFSET ")
            .push_bind(pagination.offset());
        let items = list_query
            .build_query_as::<NotificationDbModel>()
            .fetch_all(&self.pool)
            .await?;

        Ok(Paginated {
            items,
            total,
            page: pagination.page,
            limit: pagination.limit,
        })
    }

    async fn mark_read(&self, id: &str, user_id: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE notification SET is_read = 1, read_at = ?, updated_at = ?
            WHERE id = ? AND user_id = ? AND is_read = 0
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE notification SET is_read = 1, read_at = ?, updated_at = ?
            WHERE user_id = ? AND is_read = 0
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn unread_count(&self, user_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notification WHERE user_id = ? AND is_read = 0")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn delete(&self, id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notification WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delivery_stats(
        &self,
        user_id: Option<&str>,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<DeliveryStats> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT channel, status, COUNT(*), COALESCE(SUM(is_read), 0) FROM notification WHERE created_at >= ",
        );
        query.push_bind(from_ms).push(" AND created_at < ").push_bind(to_ms);
        if let Some(user_id) = user_id {
            query.push(" AND user_id = ").push_bind(user_id);
        }
        query.push(" GROUP BY channel, status");

        let rows: Vec<(String, String, i64, i64)> =
            query.build_query_as().fetch_all(&self.pool).await?;

        let mut stats = DeliveryStats::default();
        for (channel, status, count, read) in rows {
            stats.total += count;
            stats.read += read;
            let per_channel: &mut ChannelDeliveryStats =
                stats.by_channel.entry(channel).or_default();
            match NotificationStatus::parse(&status) {
                Some(NotificationStatus::Pending) => stats.pending += count,
                Some(NotificationStatus::Sent) => {
                    stats.sent += count;
                    per_channel.sent += count;
                }
                Some(NotificationStatus::Failed) => {
                    stats.failed += count;
                    per_channel.failed += count;
                }
                Some(NotificationStatus::DeadLettered) => {
                    stats.dead_lettered += count;
                    per_channel.failed += count;
                }
                None => {}
            }
        }
        Ok(stats)
    }
}
