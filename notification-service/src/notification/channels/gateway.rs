//! HTTP gateway channel.
//!
//! Email, SMS and push are delivered by POSTing the rendered message as JSON
//! to a relay that owns the provider protocol.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use super::{ChannelHandler, ChannelMessage, ChannelReceipt};
use crate::config::GatewayConfig;
use crate::database::models::Channel;
use crate::notification::preferences::{is_valid_email, is_valid_phone};
use crate::utils::http_client::install_rustls_provider;
use crate::{Error, Result};

pub struct GatewayChannel {
    channel: Channel,
    config: GatewayConfig,
    client: Client,
}

impl GatewayChannel {
    pub fn new(channel: Channel, config: GatewayConfig) -> Result<Self> {
        install_rustls_provider();

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::config(format!("Failed to build {channel} gateway client: {e}")))?;

        Ok(Self {
            channel,
            config,
            client,
        })
    }

    fn build_payload(&self, message: &ChannelMessage) -> serde_json::Value {
        json!({
            "notification_id": message.notification_id,
            "user_id": message.user_id,
            "channel": self.channel.as_str(),
            "recipient": message.recipient,
            "event_type": message.event_type.as_str(),
            "priority": message.priority.as_str(),
            "title": message.title,
            "body": message.body,
            "metadata": message.metadata,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ChannelHandler for GatewayChannel {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.url.is_empty()
    }

    fn validate(&self, message: &ChannelMessage) -> Result<()> {
        let recipient = message.recipient.as_deref().unwrap_or("").trim();
        match self.channel {
            Channel::Email if !is_valid_email(recipient) => Err(Error::validation(format!(
                "user {} has no valid email address",
                message.user_id
            ))),
            Channel::Sms if !is_valid_phone(recipient) => Err(Error::validation(format!(
                "user {} has no valid phone number",
                message.user_id
            ))),
            _ if recipient.is_empty() => Err(Error::validation(format!(
                "no recipient for {} delivery",
                self.channel
            ))),
            _ => Ok(()),
        }
    }

    async fn send(&self, message: &ChannelMessage) -> Result<ChannelReceipt> {
        let payload = self.build_payload(message);
        let response = self
            .authorize(self.client.post(&self.config.url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("{} gateway request failed: {e}", self.channel)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(channel = %self.channel, %status, "Gateway rejected notification");
            return Err(Error::Delivery(format!(
                "{} gateway returned {status}: {body}",
                self.channel
            )));
        }

        let provider_message_id = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string));

        debug!(
            channel = %self.channel,
            notification_id = %message.notification_id,
            "Gateway accepted notification"
        );
        Ok(ChannelReceipt {
            provider_message_id,
        })
    }

    async fn test_connection(&self) -> Result<()> {
        let response = self
            .authorize(self.client.get(&self.config.url))
            .send()
            .await
            .map_err(|e| {
                Error::channel_unavailable(self.channel.as_str(), format!("gateway unreachable: {e}"))
            })?;

        if response.status().is_server_error() {
            return Err(Error::channel_unavailable(
                self.channel.as_str(),
                format!("gateway returned {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::events::{EventType, NotificationPriority};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn gateway(channel: Channel, url: &str) -> GatewayChannel {
        GatewayChannel::new(
            channel,
            GatewayConfig {
                enabled: true,
                url: url.to_string(),
                token: Some("secret".to_string()),
                timeout_secs: 5,
            },
        )
        .unwrap()
    }

    fn message(channel: Channel, recipient: Option<&str>) -> ChannelMessage {
        ChannelMessage {
            notification_id: "n-1".to_string(),
            user_id: "u-1".to_string(),
            event_type: EventType::FileUploaded,
            channel,
            title: "File uploaded".to_string(),
            body: "report.pdf was uploaded successfully.".to_string(),
            priority: NotificationPriority::Normal,
            metadata: Default::default(),
            recipient: recipient.map(str::to_string),
        }
    }

    /// Serve one canned HTTP response and return the URL.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/send")
    }

    #[test]
    fn test_validate_recipients() {
        let email = gateway(Channel::Email, "http://localhost/email");
        assert!(email.validate(&message(Channel::Email, Some("a@b.io"))).is_ok());
        assert!(email.validate(&message(Channel::Email, Some("nope"))).is_err());
        assert!(email.validate(&message(Channel::Email, None)).is_err());

        let sms = gateway(Channel::Sms, "http://localhost/sms");
        assert!(sms.validate(&message(Channel::Sms, Some("+15551234567"))).is_ok());
        assert!(sms.validate(&message(Channel::Sms, Some("a@b.io"))).is_err());

        let push = gateway(Channel::Push, "http://localhost/push");
        assert!(push.validate(&message(Channel::Push, Some("u-1"))).is_ok());
        assert!(push.validate(&message(Channel::Push, None)).is_err());
    }

    #[test]
    fn test_disabled_without_url() {
        let channel = GatewayChannel::new(Channel::Push, GatewayConfig::default()).unwrap();
        assert!(!channel.is_enabled());
    }

    #[tokio::test]
    async fn test_send_success() {
        let url = serve_once("200 OK", r#"{"id":"provider-7"}"#).await;
        let channel = gateway(Channel::Push, &url);
        let receipt = channel
            .send(&message(Channel::Push, Some("u-1")))
            .await
            .unwrap();
        assert_eq!(receipt.provider_message_id.as_deref(), Some("provider-7"));
    }

    #[tokio::test]
    async fn test_send_rejected() {
        let url = serve_once("503 Service Unavailable", r#"{"error":"down"}"#).await;
        let channel = gateway(Channel::Push, &url);
        let err = channel
            .send(&message(Channel::Push, Some("u-1")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Delivery(_)));
        assert!(err.to_string().contains("503"));
    }
}
