//! Streaming completion types and utilities

use crate::error::Result;
use crate::types::FinishReason;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// One increment of a streamed completion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionChunk {
    /// Text appended by this increment (may be empty)
    pub delta: String,
    /// Set on the increment that ends generation
    pub finish_reason: Option<FinishReason>,
}

impl CompletionChunk {
    /// A chunk carrying text only
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            finish_reason: None,
        }
    }

    /// A terminating chunk
    pub fn finished(reason: FinishReason) -> Self {
        Self {
            delta: String::new(),
            finish_reason: Some(reason),
        }
    }

    /// Whether this chunk ends the stream
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// A pull-based stream of completion increments.
///
/// The stream ends either when it yields `None` or after a chunk with a
/// finish reason; consumers must treat both as end of stream.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk>> + Send>>;
