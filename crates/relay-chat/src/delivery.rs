//! Chat platform delivery contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// A message the platform has accepted and that can be edited later
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub channel_id: String,
    pub message_id: String,
}

impl MessageHandle {
    pub fn new(channel_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message_id: message_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Success,
    Error,
}

impl NoticeKind {
    /// Accent color used by platforms that render embeds
    pub fn color(&self) -> u32 {
        match self {
            NoticeKind::Success => 0x379C6F,
            NoticeKind::Error => 0xCC0000,
        }
    }
}

/// A short titled notice, e.g. an error or a command confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub description: String,
}

impl Notice {
    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Error,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn success(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Success,
            title: title.into(),
            description: description.into(),
        }
    }

    /// Plain-text rendering for platforms without rich messages
    pub fn render(&self) -> String {
        format!("**{}**\n{}", self.title, self.description)
    }
}

/// Operations the orchestrator needs from the chat platform
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Post a new message, optionally as a reply
    async fn send_new(
        &self,
        channel_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<MessageHandle, DeliveryError>;

    /// Replace the text of a previously sent message
    async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), DeliveryError>;

    /// Show a typing indicator; best effort
    async fn typing(&self, _channel_id: &str) -> Result<(), DeliveryError> {
        Ok(())
    }

    /// Post a notice
    async fn send_notice(
        &self,
        channel_id: &str,
        notice: &Notice,
    ) -> Result<MessageHandle, DeliveryError> {
        self.send_new(channel_id, &notice.render(), None).await
    }
}
