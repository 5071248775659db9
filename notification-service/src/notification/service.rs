//! Notification service facade.
//!
//! Wires the preference resolver, template renderer, batching engine,
//! dispatcher, retry engine, dead-letter store and ledger together. Owns the
//! periodic background tasks and the inbound event listener.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batching::{AggregationStore, BatchingEngine, FlushReport, InMemoryAggregationStore};
use super::channels::{ChannelHandler, ChannelRegistry};
use super::dead_letter::{DeadLetterEntry, DeadLetterPassReport, DeadLetterStore, ReplayOutcome};
use super::dispatcher::ChannelDispatcher;
use super::events::{DomainEvent, EventType};
use super::ledger::{NotificationLedger, NotificationRecord};
use super::preferences::{PreferenceResolver, UpdatePreferences, UserNotificationPreferences};
use super::retry::{RetryEngine, RetryPassReport};
use super::scheduler::spawn_periodic;
use super::template::{NewTemplate, TemplateRenderer, TemplateUpdate};
use super::types::{NotificationRequest, SendResponse, SendStatus};
use crate::config::NotificationServiceConfig;
use crate::database::DbPool;
use crate::database::models::{Channel, DeliveryStats, NotificationTemplateDbModel, Paginated};
use crate::database::repositories::{
    DeadLetterFilter, DeadLetterRepository, NotificationFilter, NotificationRepository,
    PreferencesRepository, SqlxDeadLetterRepository, SqlxNotificationRepository,
    SqlxPreferencesRepository, SqlxTemplateRepository, TemplateRepository,
};
use crate::{Error, Result};

/// Storage backends used by the service.
#[derive(Clone)]
pub struct Repositories {
    pub notifications: Arc<dyn NotificationRepository>,
    pub preferences: Arc<dyn PreferencesRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
}

impl Repositories {
    pub fn sqlx(pool: DbPool) -> Self {
        Self {
            notifications: Arc::new(SqlxNotificationRepository::new(pool.clone())),
            preferences: Arc::new(SqlxPreferencesRepository::new(pool.clone())),
            templates: Arc::new(SqlxTemplateRepository::new(pool.clone())),
            dead_letters: Arc::new(SqlxDeadLetterRepository::new(pool)),
        }
    }
}

/// Service statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub channels: Vec<Channel>,
    pub available_channels: Vec<Channel>,
    pub unprocessed_dead_letters: i64,
    pub background_tasks: usize,
    pub batching_enabled: bool,
}

/// The notification service.
pub struct NotificationService {
    config: NotificationServiceConfig,
    registry: Arc<ChannelRegistry>,
    preferences: Arc<PreferenceResolver>,
    renderer: Arc<TemplateRenderer>,
    ledger: Arc<NotificationLedger>,
    dead_letters: Arc<DeadLetterStore>,
    retry: Arc<RetryEngine>,
    dispatcher: Arc<ChannelDispatcher>,
    batching: Arc<BatchingEngine>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationService {
    pub fn new(
        config: NotificationServiceConfig,
        repositories: Repositories,
        aggregation: Arc<dyn AggregationStore>,
        registry: Arc<ChannelRegistry>,
    ) -> Self {
        let send_timeout = config.delivery.send_timeout();

        let preferences = Arc::new(PreferenceResolver::new(repositories.preferences));
        let renderer = Arc::new(TemplateRenderer::new(repositories.templates));
        let ledger = Arc::new(NotificationLedger::new(repositories.notifications));
        let dead_letters = Arc::new(DeadLetterStore::new(
            repositories.dead_letters,
            ledger.clone(),
            registry.clone(),
            preferences.clone(),
            config.dead_letter.clone(),
            send_timeout,
        ));
        let retry = Arc::new(RetryEngine::new(
            ledger.clone(),
            registry.clone(),
            preferences.clone(),
            dead_letters.clone(),
            &config.retry,
            send_timeout,
        ));
        let dispatcher = Arc::new(ChannelDispatcher::new(
            registry.clone(),
            ledger.clone(),
            renderer.clone(),
            preferences.clone(),
            retry.clone(),
            send_timeout,
        ));
        let batching = Arc::new(BatchingEngine::new(
            aggregation,
            preferences.clone(),
            dispatcher.clone(),
            config.batching.clone(),
        ));

        Self {
            config,
            registry,
            preferences,
            renderer,
            ledger,
            dead_letters,
            retry,
            dispatcher,
            batching,
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// SQLite-backed service with an in-memory aggregation store.
    pub fn from_pool(config: NotificationServiceConfig, pool: DbPool) -> Self {
        Self::new(
            config,
            Repositories::sqlx(pool),
            Arc::new(InMemoryAggregationStore::new()),
            Arc::new(ChannelRegistry::new()),
        )
    }

    pub fn config(&self) -> &NotificationServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn register_channel(&self, handler: Arc<dyn ChannelHandler>) {
        self.registry.register(handler);
    }

    // ========== Ingestion ==========

    /// Route a request through preferences, quiet hours and batching, then
    /// dispatch it.
    ///
    /// Dispatch runs on its own task, so a caller that goes away after the
    /// request was accepted does not interrupt delivery.
    pub async fn send_notification(&self, request: &NotificationRequest) -> Result<SendResponse> {
        request.validate()?;
        let prefs = self.preferences.get_preferences(&request.user_id).await;

        if !prefs.is_event_subscribed(request.event_type) {
            debug!(
                user_id = %request.user_id,
                event_type = %request.event_type,
                "User not subscribed, skipping notification"
            );
            return Ok(SendResponse::without_record(SendStatus::Skipped, request.channel));
        }

        if prefs.suppresses(request.event_type, request.bypass_quiet_hours, Utc::now()) {
            debug!(
                user_id = %request.user_id,
                event_type = %request.event_type,
                "Quiet hours active, suppressing notification"
            );
            return Ok(SendResponse::without_record(SendStatus::Suppressed, request.channel));
        }

        if self.batching.should_batch(request) {
            return self.batching.add_to_batch(request).await;
        }

        let dispatcher = self.dispatcher.clone();
        let request = request.clone();
        tokio::spawn(async move { dispatcher.send(&request).await })
            .await
            .map_err(|e| Error::Other(format!("dispatch task failed: {e}")))?
    }

    /// Deliver directly, walking the user's enabled channels until one
    /// succeeds. Skips batching and quiet hours.
    pub async fn send_with_fallback(&self, request: &NotificationRequest) -> Result<SendResponse> {
        let dispatcher = self.dispatcher.clone();
        let request = request.clone();
        tokio::spawn(async move { dispatcher.send_with_fallback(&request).await })
            .await
            .map_err(|e| Error::Other(format!("dispatch task failed: {e}")))?
    }

    /// Translate a domain event and send it.
    pub async fn handle_event(&self, event: &DomainEvent) -> Result<SendResponse> {
        self.send_notification(&event.to_request()).await
    }

    /// Consume domain events until the channel closes or the service stops.
    pub fn listen_for_events(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<DomainEvent>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Domain event listener shutting down");
                        break;
                    }
                    result = rx.recv() => {
                        match result {
                            Ok(event) => {
                                let service = service.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = service.handle_event(&event).await {
                                        warn!(
                                            user_id = %event.user_id,
                                            event_type = %event.event_type,
                                            error = %e,
                                            "Failed to handle domain event"
                                        );
                                    }
                                });
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Domain event listener lagged by {} events", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Domain event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    // ========== Background tasks ==========

    /// Test every channel connection and spawn the periodic passes.
    pub async fn start(self: &Arc<Self>) {
        if !self.tasks.lock().is_empty() {
            warn!("Notification service already started");
            return;
        }

        for (channel, result) in self.registry.test_connections().await {
            match result {
                Ok(()) => info!(%channel, "Channel ready"),
                Err(e) => warn!(%channel, error = %e, "Channel unavailable at startup"),
            }
        }

        let token = self.cancellation_token.clone();
        let mut tasks = Vec::with_capacity(4);

        if self.batching.is_enabled() {
            let batching = self.batching.clone();
            tasks.push(spawn_periodic(
                "batch_flush",
                Duration::from_secs(self.config.batching.flush_interval_secs),
                token.clone(),
                move || {
                    let batching = batching.clone();
                    async move { batching.flush().await.map(|_| ()) }
                },
            ));
        }

        let retry = self.retry.clone();
        tasks.push(spawn_periodic(
            "scheduled_retry",
            Duration::from_secs(self.config.retry.interval_secs),
            token.clone(),
            move || {
                let retry = retry.clone();
                async move { retry.process_due().await.map(|_| ()) }
            },
        ));

        let dead_letters = self.dead_letters.clone();
        tasks.push(spawn_periodic(
            "dead_letter_retry",
            Duration::from_secs(self.config.dead_letter.interval_secs),
            token.clone(),
            move || {
                let dead_letters = dead_letters.clone();
                async move { dead_letters.process_ready().await.map(|_| ()) }
            },
        ));

        let dead_letters = self.dead_letters.clone();
        tasks.push(spawn_periodic(
            "dead_letter_cleanup",
            Duration::from_secs(self.config.dead_letter.cleanup_interval_secs),
            token,
            move || {
                let dead_letters = dead_letters.clone();
                async move { dead_letters.cleanup().await.map(|_| ()) }
            },
        ));

        info!(tasks = tasks.len(), "Notification service started");
        self.tasks.lock().extend(tasks);
    }

    /// Stop the background tasks, letting in-flight passes finish, then
    /// flush whatever is still buffered.
    pub async fn stop(&self) {
        info!("Stopping notification service");
        self.cancellation_token.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if self.batching.is_enabled() {
            match self.batching.flush().await {
                Ok(report) if report.notifications > 0 => {
                    info!(notifications = report.notifications, "Flushed remaining batches")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Final batch flush failed"),
            }
        }

        info!("Notification service stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled() && !self.tasks.lock().is_empty()
    }

    /// Run one batch flush now.
    pub async fn flush_batches(&self) -> Result<FlushReport> {
        self.batching.flush().await
    }

    /// Run one scheduled-retry pass at `now`.
    pub async fn process_retries_at(&self, now: DateTime<Utc>) -> Result<RetryPassReport> {
        self.retry.process_due_at(now).await
    }

    /// Run one dead-letter replay pass at `now`.
    pub async fn process_dead_letters_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterPassReport> {
        self.dead_letters.process_ready_at(now).await
    }

    /// Run one dead-letter cleanup at `now`.
    pub async fn cleanup_dead_letters_at(&self, now: DateTime<Utc>) -> Result<u64> {
        self.dead_letters.cleanup_at(now).await
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        let channels = self.registry.channels();
        let available_channels = channels
            .iter()
            .copied()
            .filter(|channel| self.registry.is_available(*channel))
            .collect();
        Ok(ServiceStats {
            channels,
            available_channels,
            unprocessed_dead_letters: self.dead_letters.count_unprocessed().await?,
            background_tasks: self.tasks.lock().len(),
            batching_enabled: self.batching.is_enabled(),
        })
    }

    // ========== Preferences ==========

    pub async fn get_preferences(&self, user_id: &str) -> UserNotificationPreferences {
        self.preferences.get_preferences(user_id).await
    }

    pub async fn update_preferences(
        &self,
        user_id: &str,
        update: &UpdatePreferences,
    ) -> Result<UserNotificationPreferences> {
        self.preferences.update_preferences(user_id, update).await
    }

    // ========== Inbox ==========

    pub async fn list_notifications(
        &self,
        user_id: &str,
        filter: &NotificationFilter,
    ) -> Result<Paginated<NotificationRecord>> {
        self.ledger.list_for_user(user_id, filter).await
    }

    pub async fn get_notification(&self, id: &str, user_id: &str) -> Result<NotificationRecord> {
        self.ledger.get_for_user(id, user_id).await
    }

    pub async fn mark_read(&self, id: &str, user_id: &str) -> Result<()> {
        self.ledger.mark_read(id, user_id).await
    }

    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        self.ledger.mark_all_read(user_id).await
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<i64> {
        self.ledger.unread_count(user_id).await
    }

    pub async fn delete_notification(&self, id: &str, user_id: &str) -> Result<()> {
        self.ledger.delete(id, user_id).await
    }

    pub async fn delivery_stats(
        &self,
        user_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<DeliveryStats> {
        self.ledger.delivery_stats(user_id, from, to).await
    }

    // ========== Templates ==========

    pub async fn create_template(
        &self,
        template: NewTemplate,
    ) -> Result<NotificationTemplateDbModel> {
        self.renderer.create_template(template).await
    }

    pub async fn update_template(
        &self,
        id: &str,
        update: TemplateUpdate,
    ) -> Result<NotificationTemplateDbModel> {
        self.renderer.update_template(id, update).await
    }

    pub async fn delete_template(&self, id: &str) -> Result<bool> {
        self.renderer.delete_template(id).await
    }

    pub async fn get_template(&self, id: &str) -> Result<NotificationTemplateDbModel> {
        self.renderer.get_template(id).await
    }

    pub async fn list_templates(
        &self,
        event_type: Option<EventType>,
    ) -> Result<Vec<NotificationTemplateDbModel>> {
        self.renderer.list_templates(event_type).await
    }

    // ========== Dead letters ==========

    pub async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Paginated<DeadLetterEntry>> {
        self.dead_letters.list(filter).await
    }

    pub async fn get_dead_letter(&self, id: &str) -> Result<DeadLetterEntry> {
        self.dead_letters.get(id).await
    }

    pub async fn retry_dead_letter(&self, id: &str) -> Result<ReplayOutcome> {
        self.dead_letters.retry(id).await
    }

    pub async fn delete_dead_letter(&self, id: &str) -> Result<()> {
        self.dead_letters.delete(id).await
    }

    pub async fn export_dead_letters(&self) -> Result<Value> {
        self.dead_letters.export().await
    }
}
