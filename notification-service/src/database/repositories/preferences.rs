//! User notification preference repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::UserPreferencesDbModel;

/// Preference repository trait.
#[async_trait]
pub trait PreferencesRepository: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<UserPreferencesDbModel>>;
    /// Insert or replace the row for `prefs.user_id`.
    async fn upsert(&self, prefs: &UserPreferencesDbModel) -> Result<()>;
    /// Insert only if no row exists. Returns whether a row was written.
    async fn insert_if_absent(&self, prefs: &UserPreferencesDbModel) -> Result<bool>;
}

/// SQLx implementation of PreferencesRepository.
pub struct SqlxPreferencesRepository {
    pool: SqlitePool,
}

impl SqlxPreferencesRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferencesRepository for SqlxPreferencesRepository {
    async fn get(&self, user_id: &str) -> Result<Option<UserPreferencesDbModel>> {
        let row = sqlx::query_as::<_, UserPreferencesDbModel>(
            "SELECT * FROM user_notification_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert(&self, prefs: &UserPreferencesDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_notification_preferences (
                user_id, subscribed_events, channel_enabled, channel_priority, event_channels,
                quiet_hours_enabled, quiet_hours_start, quiet_hours_end, email, phone,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                subscribed_events = excluded.subscribed_events,
                channel_enabled = excluded.channel_enabled,
                channel_priority = excluded.channel_priority,
                event_channels = excluded.event_channels,
                quiet_hours_enabled = excluded.quiet_hours_enabled,
                quiet_hours_start = excluded.quiet_hours_start,
                quiet_hours_end = excluded.quiet_hours_end,
                email = excluded.email,
                phone = excluded.phone,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&prefs.user_id)
        .bind(&prefs.subscribed_events)
        .bind(&prefs.channel_enabled)
        .bind(&prefs.channel_priority)
        .bind(&prefs.event_channels)
        .bind(prefs.quiet_hours_enabled)
        .bind(&prefs.quiet_hours_start)
        .bind(&prefs.quiet_hours_end)
        .bind(&prefs.email)
        .bind(&prefs.phone)
        .bind(prefs.created_at)
        .bind(prefs.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_if_absent(&self, prefs: &UserPreferencesDbModel) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO user_notification_preferences (
                user_id, subscribed_events, channel_enabled, channel_priority, event_channels,
                quiet_hours_enabled, quiet_hours_start, quiet_hours_end, email, phone,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&prefs.user_id)
        .bind(&prefs.subscribed_events)
        .bind(&prefs.channel_enabled)
        .bind(&prefs.channel_priority)
        .bind(&prefs.event_channels)
        .bind(prefs.quiet_hours_enabled)
        .bind(&prefs.quiet_hours_start)
        .bind(&prefs.quiet_hours_end)
        .bind(&prefs.email)
        .bind(&prefs.phone)
        .bind(prefs.created_at)
        .bind(prefs.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
