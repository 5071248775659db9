//! Dead-letter repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::database::models::{DeadLetterDbModel, DeliveryAttempt, Paginated, Pagination};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Filters for listing dead-letter entries.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub processed: Option<bool>,
    pub user_id: Option<String>,
    pub pagination: Pagination,
}

/// Dead-letter repository trait.
///
/// Appends to the retry history are guarded so the history never grows past
/// `max_retries` while the entry is unprocessed.
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn insert(&self, entry: &DeadLetterDbModel) -> Result<()>;
    async fn get(&self, id: &str) -> Result<DeadLetterDbModel>;
    async fn find_by_notification(&self, notification_id: &str)
    -> Result<Option<DeadLetterDbModel>>;
    async fn list(&self, filter: &DeadLetterFilter) -> Result<Paginated<DeadLetterDbModel>>;
    async fn list_all(&self) -> Result<Vec<DeadLetterDbModel>>;
    /// Unprocessed entries due at `now_ms` with history below the ceiling.
    async fn list_ready(&self, now_ms: i64, limit: u32) -> Result<Vec<DeadLetterDbModel>>;

    /// Append a failed attempt and reschedule.
    async fn record_failure(
        &self,
        id: &str,
        attempt: &DeliveryAttempt,
        next_retry_at: i64,
    ) -> Result<bool>;
    /// Mark processed, appending `attempt` to the history when given.
    async fn mark_processed(
        &self,
        id: &str,
        attempt: Option<&DeliveryAttempt>,
        reason: &str,
    ) -> Result<bool>;

    async fn delete(&self, id: &str) -> Result<bool>;
    /// Remove processed entries last touched before `before_ms`.
    async fn cleanup_processed(&self, before_ms: i64) -> Result<u64>;
    async fn count_unprocessed(&self) -> Result<i64>;
}

/// SQLx implementation of DeadLetterRepository.
pub struct SqlxDeadLetterRepository {
    pool: SqlitePool,
}

impl SqlxDeadLetterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a DeadLetterFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(processed) = filter.processed {
        builder.push(" AND processed = ").push_bind(processed);
    }
    if let Some(user_id) = &filter.user_id {
        builder.push(" AND user_id = ").push_bind(user_id.as_str());
    }
}

#[async_trait]
impl DeadLetterRepository for SqlxDeadLetterRepository {
    async fn insert(&self, entry: &DeadLetterDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_dead_letter (
                id, notification_id, user_id, event_type, channel, event_payload,
                failure_reason, retry_attempts, max_retries, processed, processed_reason,
                next_retry_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.notification_id)
        .bind(&entry.user_id)
        .bind(&entry.event_type)
        .bind(&entry.channel)
        .bind(&entry.event_payload)
        .bind(&entry.failure_reason)
        .bind(&entry.retry_attempts)
        .bind(entry.max_retries)
        .bind(entry.processed)
        .bind(&entry.processed_reason)
        .bind(entry.next_retry_at)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<DeadLetterDbModel> {
        sqlx::query_as::<_, DeadLetterDbModel>(
            "SELECT * FROM notification_dead_letter WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("DeadLetterEntry", id))
    }

    async fn find_by_notification(
        &self,
        notification_id: &str,
    ) -> Result<Option<DeadLetterDbModel>> {
        let row = sqlx::query_as::<_, DeadLetterDbModel>(
            "SELECT * FROM notification_dead_letter WHERE notification_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Paginated<DeadLetterDbModel>> {
        let pagination = filter.pagination.normalized();

        let mut count_query =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM notification_dead_letter");
        push_filters(&mut count_query, filter);
        let (total,): (i64,) = count_query.build_query_as().fetch_one(&self.pool).await?;

        let mut list_query = QueryBuilder::<Sqlite>::new("SELECT * FROM notification_dead_letter");
        push_filters(&mut list_query, filter);
        list_query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(pagination.limit))
            .push(" OFFSET ")
            .push_bind(pagination.offset());
        let items = list_query
            .build_query_as::<DeadLetterDbModel>()
            .fetch_all(&self.pool)
            .await?;

        Ok(Paginated {
            items,
            total,
            page: pagination.page,
            limit: pagination.limit,
        })
    }

    async fn list_all(&self) -> Result<Vec<DeadLetterDbModel>> {
        let rows = sqlx::query_as::<_, DeadLetterDbModel>(
            "SELECT * FROM notification_dead_letter ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_ready(&self, now_ms: i64, limit: u32) -> Result<Vec<DeadLetterDbModel>> {
        let rows = sqlx::query_as::<_, DeadLetterDbModel>(
            r#"
            SELECT * FROM notification_dead_letter
            WHERE processed = 0
              AND next_retry_at <= ?
              AND json_array_length(retry_attempts) < max_retries
            ORDER BY next_retry_at ASC
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_failure(
        &self,
        id: &str,
        attempt: &DeliveryAttempt,
        next_retry_at: i64,
    ) -> Result<bool> {
        let attempt_json = serde_json::to_string(attempt)?;
        let result = sqlx::query(
            r#"
            UPDATE notification_dead_letter SET
                retry_attempts = json_insert(retry_attempts, '$[#]', json(?)),
                failure_reason = COALESCE(?, failure_reason),
                next_retry_at = ?,
                updated_at = ?
            WHERE id = ?
              AND processed = 0
              AND json_array_length(retry_attempts) < max_retries
            "#,
        )
        .bind(attempt_json)
        .bind(&attempt.error)
        .bind(next_retry_at)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_processed(
        &self,
        id: &str,
        attempt: Option<&DeliveryAttempt>,
        reason: &str,
    ) -> Result<bool> {
        let attempt_json = attempt.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE notification_dead_letter SET
                retry_attempts = CASE
                    WHEN ? IS NULL THEN retry_attempts
                    ELSE json_insert(retry_attempts, '$[#]', json(?))
                END,
                processed = 1,
                processed_reason = ?,
                updated_at = ?
            WHERE id = ? AND processed = 0
            "#,
        )
        .bind(&attempt_json)
        .bind(&attempt_json)
        .bind(reason)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notification_dead_letter WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_processed(&self, before_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM notification_dead_letter WHERE processed = 1 AND updated_at < ?",
        )
        .bind(before_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_unprocessed(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notification_dead_letter WHERE processed = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
