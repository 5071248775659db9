//! Notification channels.
//!
//! Each delivery medium is a [`ChannelHandler`] registered under its
//! [`Channel`] in a [`ChannelRegistry`]. The pipeline only depends on the
//! handler contract, never on transport specifics:
//! - In-app (the ledger is the inbox)
//! - HTTP gateway relays for email, SMS and push

mod gateway;
mod in_app;

pub use gateway::GatewayChannel;
pub use in_app::InAppChannel;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::events::{EventType, NotificationPriority};
use crate::database::models::{Channel, DeliveryAttempt};
use crate::{Error, Result};

/// Fully rendered message handed to a channel handler.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelMessage {
    pub notification_id: String,
    pub user_id: String,
    pub event_type: EventType,
    pub channel: Channel,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    pub metadata: Map<String, Value>,
    /// Address on the channel: email for email, phone for SMS, user id otherwise.
    pub recipient: Option<String>,
}

impl ChannelMessage {
    /// Same message addressed to another channel.
    pub fn for_channel(&self, channel: Channel, recipient: Option<String>) -> Self {
        Self {
            channel,
            recipient,
            ..self.clone()
        }
    }
}

/// Handler acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelReceipt {
    /// Provider-assigned message id, if the transport returns one.
    pub provider_message_id: Option<String>,
}

/// Trait for channel handlers.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Channel this handler delivers on.
    fn channel(&self) -> Channel;

    /// Check if the handler is enabled.
    fn is_enabled(&self) -> bool;

    /// Reject messages this handler can never deliver (missing recipient, ...).
    fn validate(&self, message: &ChannelMessage) -> Result<()>;

    /// Deliver one message.
    async fn send(&self, message: &ChannelMessage) -> Result<ChannelReceipt>;

    /// Check that the transport is reachable.
    async fn test_connection(&self) -> Result<()>;
}

/// Result of a single timed delivery attempt.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub attempt: DeliveryAttempt,
    pub result: Result<ChannelReceipt>,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error_message(&self) -> Option<String> {
        self.result.as_ref().err().map(|e| e.to_string())
    }
}

/// Registry mapping each channel to its handler.
#[derive(Default)]
pub struct ChannelRegistry {
    handlers: RwLock<HashMap<Channel, Arc<dyn ChannelHandler>>>,
    /// Channels whose last connection test failed.
    unhealthy: RwLock<HashSet<Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any existing handler for its channel.
    pub fn register(&self, handler: Arc<dyn ChannelHandler>) {
        let channel = handler.channel();
        if self.handlers.write().insert(channel, handler).is_some() {
            debug!(%channel, "Replaced channel handler");
        } else {
            debug!(%channel, "Registered channel handler");
        }
        self.unhealthy.write().remove(&channel);
    }

    pub fn unregister(&self, channel: Channel) -> bool {
        self.unhealthy.write().remove(&channel);
        self.handlers.write().remove(&channel).is_some()
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers.read().get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.handlers.read().keys().copied().collect();
        channels.sort();
        channels
    }

    /// Whether a send on `channel` could currently be attempted.
    pub fn is_available(&self, channel: Channel) -> bool {
        self.get(channel).is_some_and(|h| h.is_enabled())
            && !self.unhealthy.read().contains(&channel)
    }

    /// Run every handler's connection test. Failing channels are treated as
    /// unavailable until a later test passes.
    pub async fn test_connections(&self) -> BTreeMap<Channel, std::result::Result<(), String>> {
        let handlers: Vec<Arc<dyn ChannelHandler>> =
            self.handlers.read().values().cloned().collect();

        let mut results = BTreeMap::new();
        for handler in handlers {
            let channel = handler.channel();
            let result = if handler.is_enabled() {
                handler.test_connection().await.map_err(|e| e.to_string())
            } else {
                Err("handler disabled".to_string())
            };
            match &result {
                Ok(()) => {
                    self.unhealthy.write().remove(&channel);
                }
                Err(e) => {
                    warn!(%channel, error = %e, "Channel connection test failed");
                    self.unhealthy.write().insert(channel);
                }
            }
            results.insert(channel, result);
        }
        results
    }

    /// Re-test only the channels currently marked unhealthy, clearing those
    /// that pass. Returns how many recovered.
    pub async fn recheck_unhealthy(&self) -> usize {
        let suspects: Vec<Arc<dyn ChannelHandler>> = {
            let unhealthy = self.unhealthy.read();
            if unhealthy.is_empty() {
                return 0;
            }
            let handlers = self.handlers.read();
            unhealthy
                .iter()
                .filter_map(|channel| handlers.get(channel).cloned())
                .collect()
        };

        let mut recovered = 0;
        for handler in suspects {
            if !handler.is_enabled() {
                continue;
            }
            let channel = handler.channel();
            match handler.test_connection().await {
                Ok(()) => {
                    self.unhealthy.write().remove(&channel);
                    info!(%channel, "Channel connection restored");
                    recovered += 1;
                }
                Err(e) => debug!(%channel, error = %e, "Channel still unreachable"),
            }
        }
        recovered
    }

    /// Run the registered handler's message validation. Channels without a
    /// handler pass; delivery reports them as unavailable.
    pub fn validate(&self, message: &ChannelMessage) -> Result<()> {
        match self.get(message.channel) {
            Some(handler) => handler.validate(message),
            None => Ok(()),
        }
    }

    fn check_available(&self, channel: Channel) -> Result<Arc<dyn ChannelHandler>> {
        let handler = self
            .get(channel)
            .ok_or_else(|| Error::channel_unavailable(channel.as_str(), "no handler registered"))?;
        if !handler.is_enabled() {
            return Err(Error::channel_unavailable(channel.as_str(), "handler disabled"));
        }
        if self.unhealthy.read().contains(&channel) {
            return Err(Error::channel_unavailable(
                channel.as_str(),
                "connection test failed",
            ));
        }
        Ok(handler)
    }

    /// One timed attempt on `message.channel`, bounded by `timeout`.
    ///
    /// Never fails itself: unavailability, validation errors, send errors
    /// and timeouts are all reported in the outcome.
    pub async fn deliver(&self, message: &ChannelMessage, timeout: Duration) -> DeliveryOutcome {
        let attempted_at = Utc::now();
        let started = Instant::now();

        let result = match self.check_available(message.channel) {
            Ok(handler) => match handler.validate(message) {
                Ok(()) => match tokio::time::timeout(timeout, handler.send(message)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Delivery(format!(
                        "send timed out after {}ms",
                        timeout.as_millis()
                    ))),
                },
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let attempt = DeliveryAttempt {
            attempted_at,
            channel: message.channel,
            success: result.is_ok(),
            duration_ms,
            error: result.as_ref().err().map(|e| e.to_string()),
        };

        DeliveryOutcome { attempt, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestHandler {
        channel: Channel,
        enabled: AtomicBool,
        healthy: AtomicBool,
        delay: Duration,
        sends: AtomicUsize,
    }

    impl TestHandler {
        fn new(channel: Channel) -> Self {
            Self {
                channel,
                enabled: AtomicBool::new(true),
                healthy: AtomicBool::new(true),
                delay: Duration::ZERO,
                sends: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChannelHandler for TestHandler {
        fn channel(&self) -> Channel {
            self.channel
        }

        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn validate(&self, message: &ChannelMessage) -> Result<()> {
            if message.recipient.is_none() {
                return Err(Error::validation("missing recipient"));
            }
            Ok(())
        }

        async fn send(&self, _message: &ChannelMessage) -> Result<ChannelReceipt> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(ChannelReceipt::default())
        }

        async fn test_connection(&self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::Delivery("connection refused".to_string()))
            }
        }
    }

    fn message(channel: Channel) -> ChannelMessage {
        ChannelMessage {
            notification_id: "n-1".to_string(),
            user_id: "u-1".to_string(),
            event_type: EventType::FileUploaded,
            channel,
            title: "t".to_string(),
            body: "b".to_string(),
            priority: NotificationPriority::Normal,
            metadata: Map::new(),
            recipient: Some("u-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_deliver_success_records_attempt() {
        let registry = ChannelRegistry::new();
        let handler = Arc::new(TestHandler::new(Channel::Push));
        registry.register(handler.clone());

        let outcome = registry
            .deliver(&message(Channel::Push), Duration::from_secs(1))
            .await;
        assert!(outcome.is_success());
        assert!(outcome.attempt.success);
        assert_eq!(outcome.attempt.channel, Channel::Push);
        assert_eq!(handler.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_or_disabled_handler_is_unavailable() {
        let registry = ChannelRegistry::new();
        let outcome = registry
            .deliver(&message(Channel::Sms), Duration::from_secs(1))
            .await;
        assert!(matches!(
            outcome.result,
            Err(Error::ChannelUnavailable { .. })
        ));
        assert!(!outcome.attempt.success);

        let handler = Arc::new(TestHandler::new(Channel::Sms));
        handler.enabled.store(false, Ordering::SeqCst);
        registry.register(handler.clone());
        let outcome = registry
            .deliver(&message(Channel::Sms), Duration::from_secs(1))
            .await;
        assert!(matches!(
            outcome.result,
            Err(Error::ChannelUnavailable { .. })
        ));
        assert_eq!(handler.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_skips_send() {
        let registry = ChannelRegistry::new();
        let handler = Arc::new(TestHandler::new(Channel::Email));
        registry.register(handler.clone());

        let mut msg = message(Channel::Email);
        msg.recipient = None;
        let outcome = registry.deliver(&msg, Duration::from_secs(1)).await;
        assert!(matches!(outcome.result, Err(Error::Validation(_))));
        assert_eq!(handler.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout() {
        let registry = ChannelRegistry::new();
        let mut handler = TestHandler::new(Channel::Push);
        handler.delay = Duration::from_secs(60);
        registry.register(Arc::new(handler));

        let outcome = registry
            .deliver(&message(Channel::Push), Duration::from_millis(100))
            .await;
        assert!(matches!(outcome.result, Err(Error::Delivery(_))));
        assert!(outcome.error_message().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_failed_connection_test_marks_unavailable() {
        let registry = ChannelRegistry::new();
        let handler = TestHandler::new(Channel::Email);
        handler.healthy.store(false, Ordering::SeqCst);
        registry.register(Arc::new(handler));
        registry.register(Arc::new(TestHandler::new(Channel::Push)));

        let results = registry.test_connections().await;
        assert!(results[&Channel::Email].is_err());
        assert!(results[&Channel::Push].is_ok());
        assert!(!registry.is_available(Channel::Email));
        assert!(registry.is_available(Channel::Push));

        let outcome = registry
            .deliver(&message(Channel::Email), Duration::from_secs(1))
            .await;
        assert!(matches!(
            outcome.result,
            Err(Error::ChannelUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_recheck_restores_recovered_channels() {
        let registry = ChannelRegistry::new();
        let email = Arc::new(TestHandler::new(Channel::Email));
        email.healthy.store(false, Ordering::SeqCst);
        registry.register(email.clone());
        registry.register(Arc::new(TestHandler::new(Channel::Push)));

        registry.test_connections().await;
        assert!(!registry.is_available(Channel::Email));
        assert_eq!(registry.recheck_unhealthy().await, 0);
        assert!(!registry.is_available(Channel::Email));

        email.healthy.store(true, Ordering::SeqCst);
        assert_eq!(registry.recheck_unhealthy().await, 1);
        assert!(registry.is_available(Channel::Email));
        assert_eq!(registry.recheck_unhealthy().await, 0);

        let outcome = registry
            .deliver(&message(Channel::Email), Duration::from_secs(1))
            .await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_validate_uses_registered_handler() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(TestHandler::new(Channel::Email)));

        let mut msg = message(Channel::Email);
        assert!(registry.validate(&msg).is_ok());
        msg.recipient = None;
        assert!(matches!(registry.validate(&msg), Err(Error::Validation(_))));
        assert!(registry.validate(&message(Channel::Sms)).is_ok());
    }
}
