//! Fire-and-forget billing notifications

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Messages the engine knows how to send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationTemplate {
    SubscriptionWelcome,
    SubscriptionConfirmed,
    PaymentSucceeded,
    PaymentFailed,
    TrialEnding,
    SubscriptionCanceled,
}

impl NotificationTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationTemplate::SubscriptionWelcome => "subscription_welcome",
            NotificationTemplate::SubscriptionConfirmed => "subscription_confirmed",
            NotificationTemplate::PaymentSucceeded => "payment_succeeded",
            NotificationTemplate::PaymentFailed => "payment_failed",
            NotificationTemplate::TrialEnding => "trial_ending",
            NotificationTemplate::SubscriptionCanceled => "subscription_canceled",
        }
    }
}

impl std::fmt::Display for NotificationTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Notification delivery is not configured")]
    NotConfigured,

    #[error("Notification rejected by provider ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Notification transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Deliver `template` to `recipient`; returns the provider's delivery id
    async fn send(
        &self,
        template: NotificationTemplate,
        recipient: &str,
        data: &Value,
    ) -> Result<String, NotificationError>;
}

/// Spawns notification sends so callers never wait on delivery
#[derive(Clone)]
pub struct Notifier {
    sender: Arc<dyn NotificationSender>,
}

impl Notifier {
    pub fn new(sender: Arc<dyn NotificationSender>) -> Self {
        Self { sender }
    }

    pub fn dispatch(&self, template: NotificationTemplate, recipient: &str, data: Value) {
        let sender = self.sender.clone();
        let recipient = recipient.to_string();

        tokio::spawn(async move {
            match sender.send(template, &recipient, &data).await {
                Ok(delivery_id) => tracing::info!(
                    template = %template,
                    recipient = %recipient,
                    delivery_id = %delivery_id,
                    "Notification sent"
                ),
                Err(NotificationError::NotConfigured) => tracing::warn!(
                    template = %template,
                    recipient = %recipient,
                    "Notifications not configured, skipping"
                ),
                Err(e) => tracing::error!(
                    template = %template,
                    recipient = %recipient,
                    error = %e,
                    "Failed to send notification"
                ),
            }
        });
    }
}
