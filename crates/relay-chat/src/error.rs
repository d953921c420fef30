//! Error types for relay-chat

use thiserror::Error;

/// Errors raised by a conversation store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// Only user and assistant messages are recorded
    #[error("Role {0} is not stored in conversation history")]
    UnsupportedRole(relay_ai::Role),

    /// The backing storage failed
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors raised by the chat platform while delivering output
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The platform rejected or failed the request
    #[error("Platform error: {0}")]
    Platform(String),

    /// The message to edit no longer exists
    #[error("Unknown message {0}")]
    UnknownMessage(String),
}

/// Why a turn did not complete
#[derive(Error, Debug)]
pub enum TurnError {
    /// The new message alone does not fit the prompt budget
    #[error("Message needs {tokens} tokens but the prompt limit is {limit}")]
    TokenLimitExceeded { tokens: usize, limit: i64 },

    /// Reading prior history failed
    #[error("Failed to fetch history: {0}")]
    HistoryFetchFailed(#[source] StoreError),

    /// The completion call or stream failed
    #[error("Completion failed: {0}")]
    CompletionFailed(#[from] relay_ai::Error),

    /// Sending or editing a chunk failed
    #[error("Delivery failed: {0}")]
    DeliveryFailed(#[from] DeliveryError),

    /// Recording the exchange failed after it was delivered
    #[error("Failed to store exchange after delivery: {0}")]
    StoreAfterDeliveryFailed(#[source] StoreError),

    /// The turn was cancelled during shutdown
    #[error("Turn cancelled")]
    Cancelled,
}

impl TurnError {
    /// Localization key of the notice shown to the user, if any
    pub fn notice_key(&self) -> Option<&'static str> {
        match self {
            TurnError::TokenLimitExceeded { .. } => Some(crate::locale::keys::TOKEN_LIMIT_REACHED),
            // The provider counted more tokens than we estimated
            TurnError::CompletionFailed(e) if e.is_context_overflow() => {
                Some(crate::locale::keys::TOKEN_LIMIT_REACHED)
            }
            TurnError::CompletionFailed(_) | TurnError::DeliveryFailed(_) => {
                Some(crate::locale::keys::ERROR_RESPONSE)
            }
            TurnError::HistoryFetchFailed(_)
            | TurnError::StoreAfterDeliveryFailed(_)
            | TurnError::Cancelled => None,
        }
    }

    /// Whether the same message could succeed if sent again later
    pub fn is_retryable(&self) -> bool {
        match self {
            TurnError::CompletionFailed(e) => e.is_retryable(),
            _ => false,
        }
    }
}
