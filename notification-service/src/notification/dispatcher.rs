//! Channel dispatcher.
//!
//! Resolves the channel, renders content, checks it against the handler,
//! records a pending ledger row and hands the message to the handler. Failures go to the retry
//! engine; `send_with_fallback` walks the user's enabled channels first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::channels::{ChannelMessage, ChannelRegistry};
use super::ledger::NotificationLedger;
use super::preferences::{PreferenceResolver, UserNotificationPreferences};
use super::retry::{FailureDisposition, RetryEngine};
use super::template::TemplateRenderer;
use super::types::{NotificationRequest, SendResponse, SendStatus};
use crate::database::models::{Channel, DeliveryAttempt, NotificationDbModel};
use crate::{Error, Result};

pub struct ChannelDispatcher {
    registry: Arc<ChannelRegistry>,
    ledger: Arc<NotificationLedger>,
    renderer: Arc<TemplateRenderer>,
    preferences: Arc<PreferenceResolver>,
    retry: Arc<RetryEngine>,
    send_timeout: Duration,
}

impl ChannelDispatcher {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        ledger: Arc<NotificationLedger>,
        renderer: Arc<TemplateRenderer>,
        preferences: Arc<PreferenceResolver>,
        retry: Arc<RetryEngine>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            ledger,
            renderer,
            preferences,
            retry,
            send_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Deliver `request` on its channel, or the user's optimal channel.
    ///
    /// Validation and channel resolution fail before anything is persisted.
    /// When no channel was requested and the optimal channel's handler
    /// rejects the message, the next enabled channel is used instead.
    /// Once the ledger row exists, delivery failures are reported in the
    /// response and handed to the retry engine rather than returned as errors.
    pub async fn send(&self, request: &NotificationRequest) -> Result<SendResponse> {
        request.validate()?;
        let prefs = self.preferences.get_preferences(&request.user_id).await;
        let candidates = match request.channel {
            Some(channel) => vec![channel],
            None => prefs.fallback_channels(request.event_type),
        };

        let mut accepted = self.accepted_messages(request, &prefs, &candidates, true).await?;
        let mut message = accepted.remove(0);
        let channel = message.channel;
        let notification = self.record(request, &mut message).await?;
        let outcome = self.registry.deliver(&message, self.send_timeout).await;

        if outcome.is_success() {
            self.ledger
                .mark_sent(&notification.id, channel, &outcome.attempt)
                .await?;
            info!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                %channel,
                event_type = %request.event_type,
                "Notification sent"
            );
            return Ok(SendResponse::sent(notification.id, channel));
        }

        self.fail(&notification, channel, &outcome.attempt).await
    }

    /// Deliver on the first channel that succeeds, trying the requested
    /// channel (if any) and then every enabled channel in priority order.
    ///
    /// Channels whose handler rejects the message are left out of the walk.
    /// One ledger row tracks the whole walk. When every channel fails, the
    /// last failure enters the ordinary retry path.
    pub async fn send_with_fallback(&self, request: &NotificationRequest) -> Result<SendResponse> {
        request.validate()?;
        let prefs = self.preferences.get_preferences(&request.user_id).await;

        let mut channels: Vec<Channel> = request.channel.into_iter().collect();
        for channel in prefs.fallback_channels(request.event_type) {
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }

        let mut messages = self.accepted_messages(request, &prefs, &channels, false).await?;
        let notification = self.record(request, &mut messages[0]).await?;
        let tried = messages.len();
        let mut last_attempt: Option<DeliveryAttempt> = None;

        for (index, mut message) in messages.into_iter().enumerate() {
            message.notification_id = notification.id.clone();
            let channel = message.channel;

            let outcome = self.registry.deliver(&message, self.send_timeout).await;
            if outcome.is_success() {
                self.ledger
                    .mark_sent(&notification.id, channel, &outcome.attempt)
                    .await?;
                info!(
                    notification_id = %notification.id,
                    %channel,
                    channels_tried = index + 1,
                    "Notification sent via fallback walk"
                );
                return Ok(SendResponse::sent(notification.id, channel));
            }

            debug!(
                notification_id = %notification.id,
                %channel,
                error = %outcome.error_message().unwrap_or_default(),
                "Channel failed, trying next"
            );
            if index + 1 < tried {
                self.ledger
                    .append_attempt(&notification.id, &outcome.attempt)
                    .await?;
            }
            last_attempt = Some(outcome.attempt);
        }

        match last_attempt {
            Some(attempt) => self.fail(&notification, attempt.channel, &attempt).await,
            None => Ok(SendResponse::without_record(
                SendStatus::Failed,
                notification.channel(),
            )),
        }
    }

    /// Render `request` for each candidate channel, keeping the messages the
    /// channel's handler accepts. With `first_only`, stops at the first
    /// accepted message. Never returns an empty list: when nothing is
    /// accepted, the first rejection is the error.
    async fn accepted_messages(
        &self,
        request: &NotificationRequest,
        prefs: &UserNotificationPreferences,
        candidates: &[Channel],
        first_only: bool,
    ) -> Result<Vec<ChannelMessage>> {
        let mut accepted = Vec::new();
        let mut first_rejection: Option<Error> = None;

        for &channel in candidates {
            let message = self.render_message(request, prefs, channel).await;
            match self.registry.validate(&message) {
                Ok(()) => {
                    accepted.push(message);
                    if first_only {
                        break;
                    }
                }
                Err(e) => {
                    debug!(
                        user_id = %request.user_id,
                        %channel,
                        error = %e,
                        "Channel rejected message"
                    );
                    first_rejection.get_or_insert(e);
                }
            }
        }

        if !accepted.is_empty() {
            return Ok(accepted);
        }
        Err(first_rejection.unwrap_or_else(|| {
            Error::channel_unavailable(
                "any",
                format!("no enabled channel for user {}", request.user_id),
            )
        }))
    }

    async fn render_message(
        &self,
        request: &NotificationRequest,
        prefs: &UserNotificationPreferences,
        channel: Channel,
    ) -> ChannelMessage {
        let rendered = self.renderer.render(request, channel).await;
        ChannelMessage {
            notification_id: String::new(),
            user_id: request.user_id.clone(),
            event_type: request.event_type,
            channel,
            title: rendered.title,
            body: rendered.body,
            priority: request.priority,
            metadata: request.metadata.clone(),
            recipient: prefs.recipient_for(channel),
        }
    }

    /// Record the pending ledger row for `message` and stamp its id.
    async fn record(
        &self,
        request: &NotificationRequest,
        message: &mut ChannelMessage,
    ) -> Result<NotificationDbModel> {
        let notification = NotificationDbModel::new(
            request.user_id.clone(),
            request.event_type,
            message.channel,
            message.title.clone(),
            message.body.clone(),
            request.priority,
            &request.metadata,
        );
        self.ledger.create(&notification).await?;
        message.notification_id = notification.id.clone();
        Ok(notification)
    }

    async fn fail(
        &self,
        notification: &NotificationDbModel,
        channel: Channel,
        attempt: &DeliveryAttempt,
    ) -> Result<SendResponse> {
        let error = attempt
            .error
            .clone()
            .unwrap_or_else(|| "delivery failed".to_string());
        warn!(
            notification_id = %notification.id,
            user_id = %notification.user_id,
            %channel,
            error = %error,
            "Notification delivery failed"
        );

        let status = match self
            .retry
            .handle_failure(notification, attempt, false, Utc::now())
            .await?
        {
            FailureDisposition::Scheduled(_) => SendStatus::Failed,
            FailureDisposition::DeadLettered => SendStatus::DeadLettered,
        };
        Ok(SendResponse::failed(
            notification.id.clone(),
            channel,
            status,
            error,
        ))
    }
}
