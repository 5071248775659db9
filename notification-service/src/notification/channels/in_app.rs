//! In-app notification channel.
//!
//! The ledger row is the in-app inbox entry, so delivery only has to
//! acknowledge the message.

use async_trait::async_trait;
use tracing::debug;

use super::{ChannelHandler, ChannelMessage, ChannelReceipt};
use crate::Result;
use crate::database::models::Channel;

pub struct InAppChannel {
    enabled: bool,
}

impl InAppChannel {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Default for InAppChannel {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ChannelHandler for InAppChannel {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn validate(&self, _message: &ChannelMessage) -> Result<()> {
        Ok(())
    }

    async fn send(&self, message: &ChannelMessage) -> Result<ChannelReceipt> {
        debug!(
            notification_id = %message.notification_id,
            user_id = %message.user_id,
            "In-app notification stored"
        );
        Ok(ChannelReceipt {
            provider_message_id: Some(message.notification_id.clone()),
        })
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::events::{EventType, NotificationPriority};

    #[tokio::test]
    async fn test_in_app_acknowledges_with_notification_id() {
        let channel = InAppChannel::default();
        let message = ChannelMessage {
            notification_id: "n-42".to_string(),
            user_id: "u".to_string(),
            event_type: EventType::FileShared,
            channel: Channel::InApp,
            title: "t".to_string(),
            body: "b".to_string(),
            priority: NotificationPriority::Low,
            metadata: Default::default(),
            recipient: None,
        };

        assert!(channel.validate(&message).is_ok());
        let receipt = channel.send(&message).await.unwrap();
        assert_eq!(receipt.provider_message_id.as_deref(), Some("n-42"));
        assert!(!InAppChannel::new(false).is_enabled());
    }
}
