//! Per-identity conversation history with token-budgeted retrieval.
//!
//! Histories are kept newest-first, so "most recent exchanges that fit a
//! budget" is a prefix scan. Both [`ConversationStore::fetch`] and
//! [`ConversationStore::optimize`] admit an exchange only while the running
//! sum stays strictly below the budget, and stop at the first one that
//! would not.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_ai::{ChatMessage, Role};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// One stored user or assistant message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub identity: String,
    pub role: Role,
    pub content: String,
    pub token_count: usize,
    /// Creation time; not consulted for budget decisions
    pub timestamp: DateTime<Utc>,
}

impl Exchange {
    /// The exchange as a prompt message
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

/// Result of a budgeted fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fetched {
    /// Included exchanges, newest first
    pub exchanges: Vec<Exchange>,
    /// Sum of their token counts
    pub tokens: usize,
}

impl Fetched {
    /// Prompt messages in chronological (oldest-first) order
    pub fn chronological_messages(&self) -> Vec<ChatMessage> {
        self.exchanges.iter().rev().map(Exchange::to_message).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

/// Storage for conversation histories, keyed by opaque identity.
///
/// Implementations must serialize operations so no caller ever observes a
/// partially updated history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Record `message` as the newest exchange of `identity`.
    async fn store(
        &self,
        identity: &str,
        message: &ChatMessage,
        token_count: usize,
    ) -> Result<(), StoreError>;

    /// Newest exchanges whose token sum stays below `max_tokens`.
    async fn fetch(&self, identity: &str, max_tokens: i64) -> Result<Fetched, StoreError>;

    /// Permanently drop the oldest exchanges that do not fit `token_limit`.
    /// Returns how many were discarded.
    async fn optimize(&self, identity: &str, token_limit: i64) -> Result<usize, StoreError>;

    /// Forget the whole history of `identity`.
    async fn clear(&self, identity: &str) -> Result<(), StoreError>;
}

/// Length and token sum of the prefix admitted under the strict budget rule
fn budget_prefix<'a>(
    history: impl IntoIterator<Item = &'a Exchange>,
    max_tokens: i64,
) -> (usize, usize) {
    let mut count = 0;
    let mut tokens: usize = 0;

    if max_tokens <= 0 {
        return (0, 0);
    }

    for exchange in history {
        let next = tokens.saturating_add(exchange.token_count);
        if (next as i128) < max_tokens as i128 {
            tokens = next;
            count += 1;
        } else {
            break;
        }
    }

    (count, tokens)
}

/// In-memory store guarded by a single mutex
#[derive(Debug, Default)]
pub struct MemoryStore {
    histories: Mutex<HashMap<String, VecDeque<Exchange>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of exchanges held for `identity`
    pub fn len(&self, identity: &str) -> usize {
        self.histories.lock().get(identity).map_or(0, VecDeque::len)
    }

    /// Whether nothing is held for `identity`
    pub fn is_empty(&self, identity: &str) -> bool {
        self.len(identity) == 0
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn store(
        &self,
        identity: &str,
        message: &ChatMessage,
        token_count: usize,
    ) -> Result<(), StoreError> {
        if message.role == Role::System {
            return Err(StoreError::UnsupportedRole(message.role));
        }

        let exchange = Exchange {
            identity: identity.to_string(),
            role: message.role,
            content: message.content.clone(),
            token_count,
            timestamp: Utc::now(),
        };

        self.histories
            .lock()
            .entry(identity.to_string())
            .or_default()
            .push_front(exchange);
        Ok(())
    }

    async fn fetch(&self, identity: &str, max_tokens: i64) -> Result<Fetched, StoreError> {
        let histories = self.histories.lock();
        let Some(history) = histories.get(identity) else {
            return Ok(Fetched::default());
        };

        let (count, tokens) = budget_prefix(history, max_tokens);
        Ok(Fetched {
            exchanges: history.iter().take(count).cloned().collect(),
            tokens,
        })
    }

    async fn optimize(&self, identity: &str, token_limit: i64) -> Result<usize, StoreError> {
        let mut histories = self.histories.lock();
        let Some(history) = histories.get_mut(identity) else {
            return Ok(0);
        };

        let (keep, _) = budget_prefix(history.iter(), token_limit);
        let discarded = history.len() - keep;
        history.truncate(keep);
        if discarded > 0 {
            tracing::debug!(identity, discarded, kept = keep, "optimized history");
        }
        Ok(discarded)
    }

    async fn clear(&self, identity: &str) -> Result<(), StoreError> {
        self.histories.lock().remove(identity);
        Ok(())
    }
}
