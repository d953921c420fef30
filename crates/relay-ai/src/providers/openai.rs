//! OpenAI Chat Completions API provider

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    providers::CompletionProvider,
    stream::{CompletionChunk, CompletionStream},
    types::{
        ChatMessage, Completion, CompletionRequest, FinishReason, ModelInfo, Role, Usage,
    },
};

/// Default API endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI API client
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the client at a compatible endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn post(&self, path: &str, body: &OpenAIRequest<'_>) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
    }
}

#[async_trait]
impl CompletionProvider for OpenAIProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = OpenAIRequest::from_request(request, false);
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            max_tokens = ?request.max_tokens,
            "OpenAI completion request"
        );
        let response = self.post("/chat/completions", &body).send().await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let parsed: ChatResponse = response.json().await?;
        let choice = parsed.choices.into_iter().next().ok_or(Error::NoChoices)?;
        let usage = parsed
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(Completion {
            message: ChatMessage::assistant(choice.message.content.unwrap_or_default()),
            usage,
            finish_reason: choice.finish_reason.as_deref().map(FinishReason::parse),
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        let body = OpenAIRequest::from_request(request, true);
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            max_tokens = ?request.max_tokens,
            "OpenAI streaming request"
        );
        let event_source = EventSource::new(self.post("/chat/completions", &body))
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source)))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        tracing::debug!("OpenAI models URL: {}/models", self.base_url);
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let list: ModelList = response.json().await?;
        Ok(list.data)
    }
}

/// Map a non-success HTTP response to an error
async fn error_from_response(response: reqwest::Response) -> Error {
    let status = response.status();
    tracing::debug!(%status, "OpenAI request failed");
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        return Error::RateLimited { retry_after };
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Error::InvalidApiKey;
    }

    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(envelope) => Error::api(
            envelope.error.error_type.unwrap_or_else(|| status.to_string()),
            envelope.error.message,
        ),
        Err(_) => Error::api(status.to_string(), text),
    }
}

fn create_stream(mut event_source: EventSource) -> impl futures::Stream<Item = Result<CompletionChunk>> {
    stream! {
        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        break;
                    }

                    let chunk: StreamChunk = match serde_json::from_str(&msg.data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            yield Err(Error::UnexpectedResponse(format!("Failed to parse chunk: {}", e)));
                            break;
                        }
                    };

                    // Only the first choice is requested
                    let Some(choice) = chunk.choices.into_iter().next() else {
                        continue;
                    };

                    let finish_reason = choice.finish_reason.as_deref().map(FinishReason::parse);
                    yield Ok(CompletionChunk {
                        delta: choice.delta.content.unwrap_or_default(),
                        finish_reason,
                    });

                    if finish_reason.is_some() {
                        break;
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(_, response)) => {
                    yield Err(error_from_response(response).await);
                    break;
                }
                Err(e) => {
                    yield Err(Error::Sse(e.to_string()));
                    break;
                }
            }
        }
        event_source.close();
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
}

impl<'a> OpenAIRequest<'a> {
    fn from_request(request: &'a CompletionRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| OpenAIMessage {
                    role: m.role,
                    content: &m.content,
                    name: m.name.as_deref(),
                })
                .collect(),
            stream,
            max_tokens: request.max_tokens,
            user: request.user.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAIMessage<'a> {
    role: Role,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<ResponseUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}
