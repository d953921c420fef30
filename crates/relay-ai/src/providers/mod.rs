//! Completion provider implementations

pub mod openai;

use crate::{Completion, CompletionRequest, CompletionStream, Error, ModelInfo, Result};
use async_trait::async_trait;

/// Trait for completion providers
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Run a completion and wait for the whole answer
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Stream a completion increment by increment
    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream>;

    /// List the models available to the configured credentials
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}

/// Check that `model_id` is among the models the provider exposes.
pub async fn ensure_model(provider: &dyn CompletionProvider, model_id: &str) -> Result<ModelInfo> {
    provider
        .list_models()
        .await?
        .into_iter()
        .find(|m| m.id == model_id)
        .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))
}

/// Get an API key from a provided value or the first set environment variable
pub fn get_api_key(provided: Option<&str>, env_vars: &[&str]) -> Result<String> {
    if let Some(key) = provided.filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }

    env_vars
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .ok_or(Error::InvalidApiKey)
}
