//! Notification delivery pipeline.
//!
//! Turns domain events into user notifications across email, SMS, push and
//! in-app channels.
//!
//! # Features
//!
//! - Per-user subscriptions, channel priorities and quiet hours
//! - Template rendering with per-event default content
//! - Batching of non-critical notifications into aggregates
//! - Scheduled retry with exponential backoff
//! - Dead-letter store with preference re-validation on replay
//! - A persistent ledger doubling as the in-app inbox
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use notification_service::notification::{DomainEvent, EventType, NotificationService};
//! use notification_service::notification::channels::InAppChannel;
//!
//! let service = Arc::new(NotificationService::from_pool(config, pool));
//! service.register_channel(Arc::new(InAppChannel::default()));
//! service.start().await;
//!
//! let event = DomainEvent::new(EventType::FileUploaded, "user-1")
//!     .with_file("file-1", "report.pdf", 1_572_864);
//! service.handle_event(&event).await?;
//! ```

pub mod batching;
pub mod channels;
pub mod dead_letter;
pub mod dispatcher;
pub mod events;
pub mod ledger;
pub mod preferences;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod template;
pub mod types;

pub use batching::{AggregationStore, BatchingEngine, InMemoryAggregationStore};
pub use channels::{ChannelHandler, ChannelMessage, ChannelReceipt, ChannelRegistry};
pub use dead_letter::{DeadLetterEntry, DeadLetterStore, ReplayOutcome};
pub use dispatcher::ChannelDispatcher;
pub use events::{DomainEvent, EventType, NotificationPriority};
pub use ledger::{NotificationLedger, NotificationRecord};
pub use preferences::{PreferenceResolver, UpdatePreferences, UserNotificationPreferences};
pub use retry::{RetryEngine, RetryPolicy};
pub use service::{NotificationService, Repositories, ServiceStats};
pub use template::{NewTemplate, TemplateRenderer, TemplateUpdate};
pub use types::{NotificationRequest, SendResponse, SendStatus};
