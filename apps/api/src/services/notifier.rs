//! Operator notifications
//!
//! Failures and new conversations are reported to operators on a best-effort
//! side channel. Delivery never blocks or fails the request that triggered
//! it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use encore_shared_config::TelegramConfig;

/// Longest excerpt of a user message included in a notification
const EXCERPT_LENGTH: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    /// A turn ended with an error, before or during streaming
    TurnFailed {
        email: String,
        room_id: Uuid,
        error: String,
        last_message: Option<String>,
    },
    /// The conversation could not be saved after the stream closed
    PersistenceFailed {
        room_id: Uuid,
        error: String,
    },
    NewConversation {
        email: String,
        room_id: Uuid,
        topic: String,
        first_message: String,
    },
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_LENGTH {
        return text.to_string();
    }
    let cut: String = text.chars().take(EXCERPT_LENGTH).collect();
    format!("{}…", cut)
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TurnFailed { .. } => "turn_failed",
            Self::PersistenceFailed { .. } => "persistence_failed",
            Self::NewConversation { .. } => "new_conversation",
        }
    }

    /// Plain text rendering for chat-style channels
    pub fn render(&self) -> String {
        let time = Utc::now().to_rfc3339();
        match self {
            Self::TurnFailed {
                email,
                room_id,
                error,
                last_message,
            } => {
                let mut text = format!(
                    "Error alert\nFrom: {}\nRoom: {}\nTime: {}\n\nError: {}",
                    email, room_id, time, error
                );
                if let Some(last) = last_message {
                    text.push_str(&format!("\n\nLast message:\n{}", excerpt(last)));
                }
                text
            }
            Self::PersistenceFailed { room_id, error } => format!(
                "Persistence failure\nRoom: {}\nTime: {}\n\nError: {}",
                room_id, time, error
            ),
            Self::NewConversation {
                email,
                room_id,
                topic,
                first_message,
            } => format!(
                "New conversation\nFrom: {}\nRoom: {}\nTopic: {}\nTime: {}\n\n{}",
                email,
                room_id,
                topic,
                time,
                excerpt(first_message)
            ),
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("channel rejected notification (status {status}): {body}")]
    Rejected { status: u16, body: String },
}

/// A channel operators receive notifications on
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Writes notifications to the log
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        match event {
            NotificationEvent::NewConversation { room_id, topic, .. } => {
                info!(room_id = %room_id, topic = %topic, "New conversation");
            }
            NotificationEvent::TurnFailed { room_id, error, .. } => {
                error!(room_id = %room_id, error = %error, "Chat turn failed");
            }
            NotificationEvent::PersistenceFailed { room_id, error } => {
                error!(room_id = %room_id, error = %error, "Conversation could not be saved");
            }
        }
        Ok(())
    }
}

/// Sends notifications through the Telegram Bot API
pub struct TelegramNotifier {
    http_client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self, NotifyError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http_client,
            config,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let response = self
            .http_client
            .post(self.config.send_message_url())
            .json(&json!({
                "chat_id": self.config.chat_id,
                "text": event.render(),
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Fans notifications out to every configured channel in the background
#[derive(Clone)]
pub struct NotificationService {
    notifiers: Arc<Vec<Arc<dyn Notifier>>>,
}

impl NotificationService {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            notifiers: Arc::new(notifiers),
        }
    }

    /// Log-only notifications
    pub fn log_only() -> Self {
        Self::new(vec![Arc::new(TracingNotifier)])
    }

    pub fn channels(&self) -> Vec<&str> {
        self.notifiers.iter().map(|n| n.name()).collect()
    }

    /// Queue an event for delivery; returns immediately
    pub fn notify(&self, event: NotificationEvent) {
        let event = Arc::new(event);
        for notifier in self.notifiers.iter() {
            let notifier = Arc::clone(notifier);
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                if let Err(e) = notifier.deliver(&event).await {
                    warn!(
                        channel = notifier.name(),
                        kind = event.kind(),
                        error = %e,
                        "Notification delivery failed"
                    );
                }
            });
        }
    }
}
