//! Token estimation for prompts and responses.
//!
//! [`TokenEstimator`] applies the per-family message overheads on top of a
//! [`Tokenizer`], which only has to report how many symbols a text encodes
//! to. [`BpeTokenizer`] counts with the model's own vocabulary;
//! [`CharRatioTokenizer`] is a rough approximation for models tiktoken
//! does not cover.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use crate::error::{Error, Result};
use crate::models::ModelFamily;
use crate::types::ChatMessage;

/// Tokens the provider adds to prime the assistant's reply.
pub const REPLY_SIGNAL_TOKENS: i64 = 3;

/// Encodes text into model symbols.
///
/// Implementations must be thread-safe since one tokenizer is shared by all
/// concurrent turns.
pub trait Tokenizer: Send + Sync {
    /// Number of symbols `text` encodes to.
    fn encoded_len(&self, text: &str) -> usize;
}

/// Exact counts from the byte-pair encoding the model was trained with.
pub struct BpeTokenizer {
    bpe: CoreBPE,
}

impl BpeTokenizer {
    /// Vocabulary of `model_id`, or `cl100k_base` for identifiers tiktoken
    /// does not know.
    pub fn for_model(model_id: &str) -> Result<Self> {
        let bpe = match tiktoken_rs::get_bpe_from_model(model_id) {
            Ok(bpe) => bpe,
            Err(e) => {
                tracing::debug!(model = model_id, error = %e, "no vocabulary for model, using cl100k_base");
                tiktoken_rs::cl100k_base().map_err(|e| Error::Tokenizer(e.to_string()))?
            }
        };
        Ok(Self { bpe })
    }
}

impl Tokenizer for BpeTokenizer {
    fn encoded_len(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }
}

impl std::fmt::Debug for BpeTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpeTokenizer").finish_non_exhaustive()
    }
}

/// The BPE tokenizer for `model_id`, or the character-ratio approximation
/// if no vocabulary loads.
pub fn default_tokenizer(model_id: &str) -> Arc<dyn Tokenizer> {
    match BpeTokenizer::for_model(model_id) {
        Ok(bpe) => Arc::new(bpe),
        Err(e) => {
            tracing::warn!(model = model_id, error = %e, "falling back to character-ratio token estimates");
            Arc::new(CharRatioTokenizer::default())
        }
    }
}

/// Character-ratio approximation: `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioTokenizer {
    chars_per_token: f64,
}

impl CharRatioTokenizer {
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            4.0
        };
        Self { chars_per_token }
    }
}

impl Default for CharRatioTokenizer {
    fn default() -> Self {
        Self::new(4.0)
    }
}

impl Tokenizer for CharRatioTokenizer {
    fn encoded_len(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        (chars as f64 / self.chars_per_token).ceil() as usize
    }
}

/// Estimates prompt tokens for one model family.
#[derive(Clone)]
pub struct TokenEstimator {
    family: ModelFamily,
    tokenizer: Arc<dyn Tokenizer>,
}

impl TokenEstimator {
    pub fn new(family: ModelFamily, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { family, tokenizer }
    }

    /// Estimator for a raw model identifier
    pub fn for_model(model_id: &str, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self::new(ModelFamily::from_model_id(model_id), tokenizer)
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// Estimate the tokens `messages` occupy in a prompt.
    ///
    /// `include_reply_signal` adds the constant the provider spends priming
    /// the reply. Never fails; the result is clamped at zero.
    pub fn estimate(&self, messages: &[ChatMessage], include_reply_signal: bool) -> usize {
        let mut total: i64 = if include_reply_signal {
            REPLY_SIGNAL_TOKENS
        } else {
            0
        };

        for message in messages {
            total += self.family.tokens_per_message();
            if message.name.is_some() {
                total += self.family.tokens_per_name();
            }
            total += self.tokenizer.encoded_len(message.role.as_str()) as i64;
            total += self.tokenizer.encoded_len(&message.content) as i64;
        }

        total.max(0) as usize
    }

    /// Estimate a single message without the reply signal.
    pub fn estimate_message(&self, message: &ChatMessage) -> usize {
        self.estimate(std::slice::from_ref(message), false)
    }
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}
