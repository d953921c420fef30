//! Immutable configuration snapshot consumed by the orchestrator.

use std::collections::HashMap;
use std::time::Duration;

use crate::locale::Language;

/// Per-channel limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Minimum time between edits of a streaming response
    pub message_edit_interval: Duration,
    /// Token budget for the whole prompt, history included
    pub prompt_token_limit: i64,
    /// Upper bound on generated tokens
    pub completion_token_limit: u32,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            message_edit_interval: Duration::from_millis(5000),
            prompt_token_limit: 500,
            completion_token_limit: 500,
        }
    }
}

/// The clear-context command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearContextSettings {
    pub enable: bool,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSettings {
    pub language: Language,
    /// Channels the bot chats in, by channel id
    pub chat_channels: HashMap<String, ChannelSettings>,
    pub clear_context: ClearContextSettings,
}

impl ServerSettings {
    /// Whether `name` invokes the clear-context command on this server
    pub fn is_clear_command(&self, name: &str) -> bool {
        self.clear_context.enable && self.clear_context.aliases.iter().any(|a| a == name)
    }

    /// Command names a platform should register for this server
    pub fn command_names(&self) -> &[String] {
        if self.clear_context.enable {
            &self.clear_context.aliases
        } else {
            &[]
        }
    }
}

/// Everything the orchestrator reads, built once at startup
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Model identifier sent to the provider
    pub model_id: String,
    /// Stream responses and edit them in place, rather than waiting for
    /// the whole answer
    pub streaming: bool,
    /// Trim each identity's history to this many tokens after a turn
    pub history_token_limit: Option<i64>,
    /// Servers by id
    pub servers: HashMap<String, ServerSettings>,
}

impl Settings {
    pub fn server(&self, server_id: &str) -> Option<&ServerSettings> {
        self.servers.get(server_id)
    }

    /// Server and channel configuration, if the bot chats in that channel
    pub fn channel(
        &self,
        server_id: &str,
        channel_id: &str,
    ) -> Option<(&ServerSettings, &ChannelSettings)> {
        let server = self.servers.get(server_id)?;
        let channel = server.chat_channels.get(channel_id)?;
        Some((server, channel))
    }
}
