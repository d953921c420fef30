//! relay-ai: completion provider abstraction layer
//!
//! This crate provides the chat message types, a provider trait for
//! streaming and non-streaming completions, token estimation, and cost
//! accounting keyed by canonical model family.

pub mod cost;
pub mod error;
pub mod models;
pub mod providers;
pub mod stream;
pub mod tokens;
pub mod types;

pub use cost::{CostEstimator, Currency, ModelPrice, PriceTable};
pub use error::{Error, Result};
pub use models::ModelFamily;
pub use providers::CompletionProvider;
pub use stream::{CompletionChunk, CompletionStream};
pub use tokens::{BpeTokenizer, CharRatioTokenizer, TokenEstimator, Tokenizer, default_tokenizer};
pub use types::*;
