//! Notification template repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::NotificationTemplateDbModel;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Template repository trait.
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<NotificationTemplateDbModel>;
    async fn list(&self, event_type: Option<&str>) -> Result<Vec<NotificationTemplateDbModel>>;
    /// Most recently updated active template for the pair, if any.
    async fn find_active(
        &self,
        event_type: &str,
        channel: &str,
    ) -> Result<Option<NotificationTemplateDbModel>>;
    async fn create(&self, template: &NotificationTemplateDbModel) -> Result<()>;
    async fn update(&self, template: &NotificationTemplateDbModel) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// SQLx implementation of TemplateRepository.
pub struct SqlxTemplateRepository {
    pool: SqlitePool,
}

impl SqlxTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for SqlxTemplateRepository {
    async fn get(&self, id: &str) -> Result<NotificationTemplateDbModel> {
        sqlx::query_as::<_, NotificationTemplateDbModel>(
            "SELECT * FROM notification_template WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("NotificationTemplate", id))
    }

    async fn list(&self, event_type: Option<&str>) -> Result<Vec<NotificationTemplateDbModel>> {
        let rows = match event_type {
            Some(event_type) => {
                sqlx::query_as::<_, NotificationTemplateDbModel>(
                    "SELECT * FROM notification_template WHERE event_type = ? ORDER BY channel, updated_at DESC",
                )
                .bind(event_type)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, NotificationTemplateDbModel>(
                    "SELECT * FROM notification_template ORDER BY event_type, channel, updated_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    async fn find_active(
        &self,
        event_type: &str,
        channel: &str,
    ) -> Result<Option<NotificationTemplateDbModel>> {
        let row = sqlx::query_as::<_, NotificationTemplateDbModel>(
            r#"
            SELECT * FROM notification_template
            WHERE event_type = ? AND channel = ? AND is_active = 1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(event_type)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create(&self, template: &NotificationTemplateDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_template (
                id, event_type, channel, subject_template, body_template, is_active,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&template.id)
        .bind(&template.event_type)
        .bind(&template.channel)
        .bind(&template.subject_template)
        .bind(&template.body_template)
        .bind(template.is_active)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, template: &NotificationTemplateDbModel) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notification_template SET
                event_type = ?,
                channel = ?,
                subject_template = ?,
                body_template = ?,
                is_active = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&template.event_type)
        .bind(&template.channel)
        .bind(&template.subject_template)
        .bind(&template.body_template)
        .bind(template.is_active)
        .bind(now_ms())
        .bind(&template.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("NotificationTemplate", &template.id));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notification_template WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
