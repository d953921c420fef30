//! Turn orchestration: one inbound chat message in, one delivered answer out.

use std::sync::Arc;

use futures::StreamExt;
use relay_ai::{
    ChatMessage, CompletionProvider, CompletionRequest, CompletionStream,
    CostEstimator, TokenEstimator, Tokenizer, default_tokenizer, tokens::REPLY_SIGNAL_TOKENS,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    assembler::{ChunkPolicy, Emission, StreamAssembler, Target},
    delivery::{Delivery, MessageHandle, Notice},
    error::{StoreError, TurnError},
    locale::{Language, Localizer, keys},
    settings::{ChannelSettings, ServerSettings, Settings},
    store::{ConversationStore, MemoryStore},
};

/// A message received from the chat platform
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub server_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    /// Sent by the bot's own account
    pub from_self: bool,
}

/// A slash-style command invocation
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub server_id: String,
    pub user_id: String,
    pub name: String,
}

/// Bookkeeping of a completed turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    /// Tokens sent, history and reply signal included
    pub prompt_tokens: usize,
    pub response_tokens: usize,
    /// Cost in the base currency
    pub cost: f64,
    /// Platform messages the answer occupies
    pub messages: usize,
    /// Whether the exchange made it into the store
    pub recorded: bool,
}

#[derive(Debug)]
pub enum TurnOutcome {
    /// Not addressed to the bot
    Ignored,
    Completed(TurnReport),
    Failed(TurnError),
}

/// Answer produced by one of the delivery paths
struct Delivered {
    response: ChatMessage,
    response_tokens: usize,
    cost: f64,
    messages: usize,
}

enum Step {
    Chunk(Option<relay_ai::Result<relay_ai::CompletionChunk>>),
    FlushDue,
}

/// Runs turns against a store, a completion provider and a chat platform
pub struct TurnOrchestrator {
    settings: Arc<Settings>,
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn CompletionProvider>,
    delivery: Arc<dyn Delivery>,
    estimator: TokenEstimator,
    costs: Arc<CostEstimator>,
    localizer: Arc<Localizer>,
    chunk_policy: ChunkPolicy,
    cancel: CancellationToken,
}

impl TurnOrchestrator {
    /// Create an orchestrator with an in-memory store, the model's BPE
    /// tokenizer and default tables
    pub fn new(
        settings: Arc<Settings>,
        provider: Arc<dyn CompletionProvider>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        let estimator =
            TokenEstimator::for_model(&settings.model_id, default_tokenizer(&settings.model_id));
        Self {
            settings,
            store: Arc::new(MemoryStore::new()),
            provider,
            delivery,
            estimator,
            costs: Arc::new(CostEstimator::default()),
            localizer: Arc::new(Localizer::with_defaults()),
            chunk_policy: ChunkPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.estimator = TokenEstimator::for_model(&self.settings.model_id, tokenizer);
        self
    }

    pub fn with_costs(mut self, costs: Arc<CostEstimator>) -> Self {
        self.costs = costs;
        self
    }

    pub fn with_localizer(mut self, localizer: Arc<Localizer>) -> Self {
        self.localizer = localizer;
        self
    }

    pub fn with_chunk_policy(mut self, policy: ChunkPolicy) -> Self {
        self.chunk_policy = policy;
        self
    }

    /// Share a shutdown token; cancelling it aborts in-flight turns
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Handle one inbound message.
    ///
    /// Failures are logged and, where the user should know, answered with a
    /// localized notice before being returned in the outcome.
    pub async fn handle_message(&self, message: &InboundMessage) -> TurnOutcome {
        if message.from_self {
            return TurnOutcome::Ignored;
        }
        let Some((server, channel)) = self
            .settings
            .channel(&message.server_id, &message.channel_id)
        else {
            return TurnOutcome::Ignored;
        };

        let span = tracing::info_span!(
            "turn",
            server = %message.server_id,
            channel = %message.channel_id,
            user = %message.author_id,
        );

        async {
            match self.run_turn(message, server, channel).await {
                Ok(report) => TurnOutcome::Completed(report),
                Err(err) => {
                    self.report_failure(message, server.language, &err).await;
                    TurnOutcome::Failed(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Execute a command. Returns the notice to show, or `None` if the
    /// command is not enabled on that server.
    pub async fn handle_command(
        &self,
        invocation: &CommandInvocation,
    ) -> Result<Option<Notice>, StoreError> {
        let Some(server) = self.settings.server(&invocation.server_id) else {
            return Ok(None);
        };
        if !server.is_clear_command(&invocation.name) {
            return Ok(None);
        }

        tracing::debug!(
            command = %invocation.name,
            user = %invocation.user_id,
            "received command"
        );
        self.store.clear(&invocation.user_id).await?;

        Ok(Some(Notice::success(
            format!("✅ {}", self.localizer.fetch(keys::CLEARED, server.language)),
            self.localizer.fetch(keys::CLEAR_CONTEXT, server.language),
        )))
    }

    async fn run_turn(
        &self,
        message: &InboundMessage,
        server: &ServerSettings,
        channel: &ChannelSettings,
    ) -> Result<TurnReport, TurnError> {
        if let Err(e) = self.delivery.typing(&message.channel_id).await {
            tracing::debug!(error = %e, "failed to send typing indicator");
        }

        let new_prompt = ChatMessage::user(message.content.clone());
        let new_tokens = self.estimator.estimate_message(&new_prompt);
        let remaining = channel.prompt_token_limit - REPLY_SIGNAL_TOKENS - new_tokens as i64;
        if remaining < 0 {
            return Err(TurnError::TokenLimitExceeded {
                tokens: new_tokens,
                limit: channel.prompt_token_limit,
            });
        }

        let history = self
            .store
            .fetch(&message.author_id, remaining)
            .await
            .map_err(TurnError::HistoryFetchFailed)?;

        let mut prompt = history.chronological_messages();
        prompt.push(new_prompt.clone());
        let prompt_tokens = history.tokens + new_tokens + REPLY_SIGNAL_TOKENS as usize;

        tracing::debug!(
            history = history.exchanges.len(),
            history_tokens = history.tokens,
            new_tokens,
            prompt_tokens,
            "assembled prompt"
        );

        let request = CompletionRequest::new(self.settings.model_id.clone(), prompt)
            .with_max_tokens(channel.completion_token_limit)
            .with_user(message.author_id.clone());

        let delivered = if self.settings.streaming {
            let stream = self.provider.stream(&request).await?;
            self.respond_streaming(message, server.language, channel, stream, prompt_tokens)
                .await?
        } else {
            self.respond_once(message, &request, prompt_tokens).await?
        };

        let recorded = match self
            .record(&message.author_id, &new_prompt, new_tokens, &delivered)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "exchange delivered but not recorded");
                false
            }
        };

        Ok(TurnReport {
            prompt_tokens,
            response_tokens: delivered.response_tokens,
            cost: delivered.cost,
            messages: delivered.messages,
            recorded,
        })
    }

    /// Stream the answer into a placeholder message, editing it in place
    /// and opening new messages whenever a chunk fills up.
    async fn respond_streaming(
        &self,
        message: &InboundMessage,
        language: Language,
        channel: &ChannelSettings,
        mut stream: CompletionStream,
        prompt_tokens: usize,
    ) -> Result<Delivered, TurnError> {
        let placeholder = self.localizer.fetch(keys::WAIT_FOR_RESPONSE, language);
        let mut target = self
            .delivery
            .send_new(&message.channel_id, &placeholder, Some(&message.id))
            .await?;
        let mut messages = 1;

        let mut assembler = StreamAssembler::new(
            self.chunk_policy,
            channel.message_edit_interval,
            Instant::now(),
        );

        loop {
            let deadline = assembler.next_flush_at();
            let pull = async {
                match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, stream.next()).await {
                        Ok(item) => Step::Chunk(item),
                        Err(_) => Step::FlushDue,
                    },
                    None => Step::Chunk(stream.next().await),
                }
            };

            let step = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.abandon(&target, &assembler, language).await;
                    return Err(TurnError::Cancelled);
                }
                step = pull => step,
            };

            let emissions = match step {
                Step::FlushDue => assembler.maybe_flush(Instant::now()),
                Step::Chunk(None) => break,
                Step::Chunk(Some(Err(e))) => return Err(TurnError::CompletionFailed(e)),
                Step::Chunk(Some(Ok(chunk))) => {
                    assembler.feed(&chunk.delta);
                    if chunk.is_terminal() {
                        break;
                    }
                    assembler.maybe_flush(Instant::now())
                }
            };
            messages += self.emit(message, &mut target, emissions).await?;
        }

        let response = ChatMessage::assistant(assembler.response());
        let response_tokens = self.estimator.estimate_message(&response);
        let cost = self.costs.prompt_cost(prompt_tokens, &self.settings.model_id)
            + self
                .costs
                .completion_cost(response_tokens, &self.settings.model_id);
        let summary = self
            .costs
            .format_summary(prompt_tokens + response_tokens, cost);

        let emissions = assembler.finish(&summary, Instant::now());
        messages += self.emit(message, &mut target, emissions).await?;

        Ok(Delivered {
            response,
            response_tokens,
            cost,
            messages,
        })
    }

    /// Wait for the whole answer and post it as one or more new messages.
    async fn respond_once(
        &self,
        message: &InboundMessage,
        request: &CompletionRequest,
        prompt_tokens: usize,
    ) -> Result<Delivered, TurnError> {
        let completion = self.provider.complete(request).await?;
        let response = completion.message;
        let response_tokens = self.estimator.estimate_message(&response);

        // Prefer the provider's own counters when it reports them
        let (billed_prompt, billed_completion) = if completion.usage.total_tokens > 0 {
            (
                completion.usage.prompt_tokens as usize,
                completion.usage.completion_tokens as usize,
            )
        } else {
            (prompt_tokens, response_tokens)
        };
        let cost = self.costs.prompt_cost(billed_prompt, &self.settings.model_id)
            + self
                .costs
                .completion_cost(billed_completion, &self.settings.model_id);
        let summary = self
            .costs
            .format_summary(billed_prompt + billed_completion, cost);

        let text = format!("{}\n\n{}", response.content, summary);
        let chunks = self.chunk_policy.chunks(&text);
        for chunk in &chunks {
            self.delivery
                .send_new(&message.channel_id, chunk, Some(&message.id))
                .await?;
        }

        Ok(Delivered {
            response,
            response_tokens,
            cost,
            messages: chunks.len(),
        })
    }

    /// Carry out emissions, returning how many new messages were opened.
    async fn emit(
        &self,
        message: &InboundMessage,
        target: &mut MessageHandle,
        emissions: Vec<Emission>,
    ) -> Result<usize, TurnError> {
        let mut opened = 0;
        for emission in emissions {
            match emission.target {
                Target::Current => self.delivery.edit(target, &emission.text).await?,
                Target::New => {
                    *target = self
                        .delivery
                        .send_new(&message.channel_id, &emission.text, Some(&message.id))
                        .await?;
                    opened += 1;
                }
            }
        }
        Ok(opened)
    }

    /// Replace the open message with what arrived before cancellation, so
    /// no placeholder is left behind. Best effort.
    async fn abandon(&self, target: &MessageHandle, assembler: &StreamAssembler, language: Language) {
        let text = if assembler.buffer().is_empty() {
            self.localizer.fetch(keys::CANCELLED, language)
        } else {
            assembler.buffer().to_string()
        };
        if let Err(e) = self.delivery.edit(target, &text).await {
            tracing::debug!(error = %e, "failed to close cancelled response");
        }
    }

    async fn record(
        &self,
        identity: &str,
        prompt: &ChatMessage,
        prompt_tokens: usize,
        delivered: &Delivered,
    ) -> Result<(), TurnError> {
        self.store
            .store(identity, prompt, prompt_tokens)
            .await
            .map_err(TurnError::StoreAfterDeliveryFailed)?;
        self.store
            .store(identity, &delivered.response, delivered.response_tokens)
            .await
            .map_err(TurnError::StoreAfterDeliveryFailed)?;

        if let Some(limit) = self.settings.history_token_limit {
            self.store
                .optimize(identity, limit)
                .await
                .map_err(TurnError::StoreAfterDeliveryFailed)?;
        }
        Ok(())
    }

    async fn report_failure(&self, message: &InboundMessage, language: Language, err: &TurnError) {
        match err {
            TurnError::Cancelled => tracing::debug!("turn cancelled"),
            TurnError::TokenLimitExceeded { .. } => tracing::debug!(error = %err, "turn rejected"),
            TurnError::CompletionFailed(e) => tracing::warn!(
                error = %e,
                retryable = err.is_retryable(),
                retry_after = ?e.retry_after(),
                context_overflow = e.is_context_overflow(),
                "completion failed"
            ),
            _ => tracing::warn!(error = %err, "turn failed"),
        }

        let Some(key) = err.notice_key() else {
            return;
        };
        let notice = Notice::error(
            self.localizer.fetch(keys::ERROR, language),
            self.localizer.fetch(key, language),
        );
        if let Err(e) = self.delivery.send_notice(&message.channel_id, &notice).await {
            tracing::error!(error = %e, "failed to send error notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::settings::ClearContextSettings;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relay_ai::{
        Completion, CompletionChunk, FinishReason, ModelInfo, Role, Usage,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct WordTokenizer;

    impl Tokenizer for WordTokenizer {
        fn encoded_len(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    #[derive(Default)]
    struct ScriptedProvider {
        deltas: Vec<String>,
        fail_stream: bool,
        error_after: Option<usize>,
        completion: Option<Completion>,
        custom: Mutex<Option<CompletionStream>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        fn streaming(deltas: &[&str]) -> Self {
            Self {
                deltas: deltas.iter().map(|d| d.to_string()).collect(),
                ..Default::default()
            }
        }

        fn with_stream(stream: CompletionStream) -> Self {
            Self {
                custom: Mutex::new(Some(stream)),
                ..Default::default()
            }
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(&self, request: &CompletionRequest) -> relay_ai::Result<Completion> {
            self.requests.lock().push(request.clone());
            self.completion.clone().ok_or(relay_ai::Error::NoChoices)
        }

        async fn stream(&self, request: &CompletionRequest) -> relay_ai::Result<CompletionStream> {
            self.requests.lock().push(request.clone());
            if self.fail_stream {
                return Err(relay_ai::Error::api("server_error", "boom"));
            }
            if let Some(stream) = self.custom.lock().take() {
                return Ok(stream);
            }

            let mut items: Vec<relay_ai::Result<CompletionChunk>> = self
                .deltas
                .iter()
                .map(|d| Ok(CompletionChunk::delta(d.clone())))
                .collect();
            match self.error_after {
                Some(n) => {
                    items.truncate(n);
                    items.push(Err(relay_ai::Error::Sse("connection reset".into())));
                }
                None => items.push(Ok(CompletionChunk::finished(FinishReason::Stop))),
            }
            Ok(Box::pin(tokio_stream::iter(items)))
        }

        async fn list_models(&self) -> relay_ai::Result<Vec<ModelInfo>> {
            Ok(vec![])
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Send {
            id: String,
            text: String,
            reply_to: Option<String>,
        },
        Edit {
            id: String,
            text: String,
        },
        Notice(Notice),
    }

    #[derive(Default)]
    struct RecordingDelivery {
        ops: Mutex<Vec<Op>>,
        fail_edits: bool,
        next_id: AtomicUsize,
    }

    impl RecordingDelivery {
        fn failing_edits() -> Self {
            Self {
                fail_edits: true,
                ..Default::default()
            }
        }

        fn ops(&self) -> Vec<Op> {
            self.ops.lock().clone()
        }

        fn edits(&self) -> Vec<String> {
            self.ops()
                .into_iter()
                .filter_map(|op| match op {
                    Op::Edit { text, .. } => Some(text),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn send_new(
            &self,
            channel_id: &str,
            text: &str,
            reply_to: Option<&str>,
        ) -> Result<MessageHandle, DeliveryError> {
            let id = format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.ops.lock().push(Op::Send {
                id: id.clone(),
                text: text.to_string(),
                reply_to: reply_to.map(str::to_string),
            });
            Ok(MessageHandle::new(channel_id, id))
        }

        async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), DeliveryError> {
            if self.fail_edits {
                return Err(DeliveryError::Platform("503 Service Unavailable".into()));
            }
            self.ops.lock().push(Op::Edit {
                id: handle.message_id.clone(),
                text: text.to_string(),
            });
            Ok(())
        }

        async fn send_notice(
            &self,
            channel_id: &str,
            notice: &Notice,
        ) -> Result<MessageHandle, DeliveryError> {
            self.ops.lock().push(Op::Notice(notice.clone()));
            Ok(MessageHandle::new(channel_id, "notice"))
        }
    }

    /// Reads work, writes fail
    #[derive(Default)]
    struct ReadOnlyStore(MemoryStore);

    #[async_trait]
    impl ConversationStore for ReadOnlyStore {
        async fn store(&self, _: &str, _: &ChatMessage, _: usize) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }

        async fn fetch(&self, identity: &str, max_tokens: i64) -> Result<crate::store::Fetched, StoreError> {
            self.0.fetch(identity, max_tokens).await
        }

        async fn optimize(&self, identity: &str, token_limit: i64) -> Result<usize, StoreError> {
            self.0.optimize(identity, token_limit).await
        }

        async fn clear(&self, identity: &str) -> Result<(), StoreError> {
            self.0.clear(identity).await
        }
    }

    fn settings_with(streaming: bool, channel: ChannelSettings) -> Settings {
        let server = ServerSettings {
            language: Language::English,
            chat_channels: HashMap::from([("chat".to_string(), channel)]),
            clear_context: ClearContextSettings {
                enable: true,
                aliases: vec!["clear".into()],
            },
        };
        Settings {
            model_id: "gpt-3.5-turbo".into(),
            streaming,
            history_token_limit: None,
            servers: HashMap::from([("guild".to_string(), server)]),
        }
    }

    fn settings(streaming: bool) -> Settings {
        settings_with(
            streaming,
            ChannelSettings {
                message_edit_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        )
    }

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            id: "in-1".into(),
            server_id: "guild".into(),
            channel_id: "chat".into(),
            author_id: "alice".into(),
            content: content.into(),
            from_self: false,
        }
    }

    fn orchestrator(
        settings: Settings,
        provider: &Arc<ScriptedProvider>,
        delivery: &Arc<RecordingDelivery>,
    ) -> TurnOrchestrator {
        TurnOrchestrator::new(Arc::new(settings), provider.clone(), delivery.clone())
            .with_tokenizer(Arc::new(WordTokenizer))
    }

    async fn history(orch: &TurnOrchestrator, identity: &str) -> Vec<(Role, String)> {
        orch.store()
            .fetch(identity, i64::MAX)
            .await
            .unwrap()
            .exchanges
            .into_iter()
            .map(|e| (e.role, e.content))
            .collect()
    }

    fn placeholder(id: &str) -> Op {
        Op::Send {
            id: id.into(),
            text: "⌛ Generating a response...".into(),
            reply_to: Some("in-1".into()),
        }
    }

    #[tokio::test]
    async fn test_streaming_turn_edits_placeholder() {
        let provider = Arc::new(ScriptedProvider::streaming(&["Hi", " there"]));
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(true), &provider, &delivery);

        let outcome = orch.handle_message(&inbound("hello there")).await;
        let TurnOutcome::Completed(report) = outcome else {
            panic!("expected completed turn, got {:?}", outcome);
        };
        // "hello there": 4 + 1 + 2; plus the reply signal
        assert_eq!(report.prompt_tokens, 10);
        assert_eq!(report.response_tokens, 7);
        assert_eq!(report.messages, 1);
        assert!(report.recorded);

        let ops = delivery.ops();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], placeholder("m0"));
        let Op::Edit { id, text } = &ops[1] else {
            panic!("expected edit, got {:?}", ops[1]);
        };
        assert_eq!(id, "m0");
        assert!(text.starts_with("Hi there\n\n💠 17  →  🇺🇸 $"));

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "gpt-3.5-turbo");
        assert_eq!(requests[0].max_tokens, Some(500));
        assert_eq!(requests[0].user.as_deref(), Some("alice"));
        assert_eq!(requests[0].messages, vec![ChatMessage::user("hello there")]);

        assert_eq!(
            history(&orch, "alice").await,
            vec![
                (Role::Assistant, "Hi there".to_string()),
                (Role::User, "hello there".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_prompt_includes_budgeted_history_oldest_first() {
        let provider = Arc::new(ScriptedProvider::streaming(&["ok"]));
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(true), &provider, &delivery);

        let store = orch.store().clone();
        store.store("alice", &ChatMessage::user("old"), 300).await.unwrap();
        store.store("alice", &ChatMessage::assistant("middle"), 150).await.unwrap();
        store.store("alice", &ChatMessage::user("recent"), 100).await.unwrap();

        let outcome = orch.handle_message(&inbound("hello there")).await;
        let TurnOutcome::Completed(report) = outcome else {
            panic!("expected completed turn, got {:?}", outcome);
        };
        // Budget 500 - 3 - 7 = 490 admits 100 + 150 but not the 300
        assert_eq!(report.prompt_tokens, 250 + 7 + 3);

        let contents: Vec<_> = provider.requests()[0]
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["middle", "recent", "hello there"]);
    }

    #[tokio::test]
    async fn test_ignores_own_and_unconfigured_messages() {
        let provider = Arc::new(ScriptedProvider::streaming(&["x"]));
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(true), &provider, &delivery);

        let mut own = inbound("hi");
        own.from_self = true;
        assert!(matches!(orch.handle_message(&own).await, TurnOutcome::Ignored));

        let mut elsewhere = inbound("hi");
        elsewhere.channel_id = "random".into();
        assert!(matches!(orch.handle_message(&elsewhere).await, TurnOutcome::Ignored));

        let mut other_server = inbound("hi");
        other_server.server_id = "other".into();
        assert!(matches!(orch.handle_message(&other_server).await, TurnOutcome::Ignored));

        assert!(delivery.ops().is_empty());
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_token_limit_exceeded_skips_provider() {
        let provider = Arc::new(ScriptedProvider::streaming(&["x"]));
        let delivery = Arc::new(RecordingDelivery::default());
        let channel = ChannelSettings {
            prompt_token_limit: 9,
            ..Default::default()
        };
        let orch = orchestrator(settings_with(true, channel), &provider, &delivery);

        let outcome = orch.handle_message(&inbound("hello there")).await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed(TurnError::TokenLimitExceeded { tokens: 7, limit: 9 })
        ));
        assert!(provider.requests().is_empty());
        assert_eq!(
            delivery.ops(),
            vec![Op::Notice(Notice::error(
                "Error",
                "Your message is too long for this channel's token limit."
            ))]
        );
    }

    #[tokio::test]
    async fn test_zero_remaining_budget_sends_only_new_message() {
        let provider = Arc::new(ScriptedProvider::streaming(&["x"]));
        let delivery = Arc::new(RecordingDelivery::default());
        let channel = ChannelSettings {
            prompt_token_limit: 10,
            ..Default::default()
        };
        let orch = orchestrator(settings_with(true, channel), &provider, &delivery);
        orch.store()
            .store("alice", &ChatMessage::user("earlier"), 1)
            .await
            .unwrap();

        let outcome = orch.handle_message(&inbound("hello there")).await;
        assert!(matches!(outcome, TurnOutcome::Completed(_)));
        assert_eq!(provider.requests()[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn test_long_stream_opens_new_message() {
        let head = format!("{}\n", "a".repeat(1799));
        let tail = "b".repeat(300);
        let provider = Arc::new(ScriptedProvider::streaming(&[&head, &tail]));
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(true), &provider, &delivery);

        let outcome = orch.handle_message(&inbound("write a lot")).await;
        let TurnOutcome::Completed(report) = outcome else {
            panic!("expected completed turn, got {:?}", outcome);
        };
        assert_eq!(report.messages, 2);

        let ops = delivery.ops();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0], placeholder("m0"));
        assert_eq!(
            ops[1],
            Op::Edit {
                id: "m0".into(),
                text: head.clone()
            }
        );
        assert_eq!(
            ops[2],
            Op::Send {
                id: "m1".into(),
                text: tail.clone(),
                reply_to: Some("in-1".into())
            }
        );
        let Op::Edit { id, text } = &ops[3] else {
            panic!("expected edit, got {:?}", ops[3]);
        };
        assert_eq!(id, "m1");
        assert!(text.starts_with(&format!("{}\n\n💠", tail)));

        for op in &ops {
            if let Op::Send { text, .. } | Op::Edit { text, .. } = op {
                assert!(text.chars().count() <= crate::assembler::MAX_CHUNK_CHARS);
            }
        }
        // The full answer is remembered, without the cost footer
        let remembered = history(&orch, "alice").await;
        assert_eq!(remembered[0].1, format!("{}{}", head, tail));
    }

    #[tokio::test]
    async fn test_delivery_failure_aborts_without_recording() {
        let provider = Arc::new(ScriptedProvider::streaming(&["Hi"]));
        let delivery = Arc::new(RecordingDelivery::failing_edits());
        let orch = orchestrator(settings(true), &provider, &delivery);

        let outcome = orch.handle_message(&inbound("hello")).await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed(TurnError::DeliveryFailed(_))
        ));
        assert!(history(&orch, "alice").await.is_empty());

        let ops = delivery.ops();
        assert_eq!(ops[0], placeholder("m0"));
        assert_eq!(
            ops.last(),
            Some(&Op::Notice(Notice::error(
                "Error",
                "Something went wrong while generating a response. Please try again later."
            )))
        );
    }

    #[tokio::test]
    async fn test_completion_failure_sends_notice() {
        let provider = Arc::new(ScriptedProvider {
            fail_stream: true,
            ..Default::default()
        });
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(true), &provider, &delivery);

        let outcome = orch.handle_message(&inbound("hello")).await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed(TurnError::CompletionFailed(_))
        ));
        let ops = delivery.ops();
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], Op::Notice(n) if n.kind == crate::delivery::NoticeKind::Error));
        assert!(history(&orch, "alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_midway_records_nothing() {
        let provider = Arc::new(ScriptedProvider {
            deltas: vec!["Hi".into(), " there".into()],
            error_after: Some(1),
            ..Default::default()
        });
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(true), &provider, &delivery);

        let outcome = orch.handle_message(&inbound("hello")).await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed(TurnError::CompletionFailed(relay_ai::Error::Sse(_)))
        ));
        assert!(history(&orch, "alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_non_streaming_turn() {
        let provider = Arc::new(ScriptedProvider {
            completion: Some(Completion {
                message: ChatMessage::assistant("Plain answer"),
                usage: Usage {
                    prompt_tokens: 12,
                    completion_tokens: 3,
                    total_tokens: 15,
                },
                finish_reason: Some(FinishReason::Stop),
            }),
            ..Default::default()
        });
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(false), &provider, &delivery);

        let outcome = orch.handle_message(&inbound("hello")).await;
        let TurnOutcome::Completed(report) = outcome else {
            panic!("expected completed turn, got {:?}", outcome);
        };
        assert_eq!(report.messages, 1);
        assert!((report.cost - 15.0 * 0.002 / 1000.0).abs() < 1e-12);

        let ops = delivery.ops();
        assert_eq!(ops.len(), 1);
        let Op::Send { text, reply_to, .. } = &ops[0] else {
            panic!("expected send, got {:?}", ops[0]);
        };
        assert!(text.starts_with("Plain answer\n\n💠 15  →"));
        assert_eq!(reply_to.as_deref(), Some("in-1"));
        assert!(delivery.edits().is_empty());
        assert_eq!(history(&orch, "alice").await.len(), 2);
    }

    #[tokio::test]
    async fn test_non_streaming_long_answer_is_split() {
        let provider = Arc::new(ScriptedProvider {
            completion: Some(Completion {
                message: ChatMessage::assistant("z".repeat(4500)),
                usage: Usage::default(),
                finish_reason: Some(FinishReason::Length),
            }),
            ..Default::default()
        });
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(false), &provider, &delivery);

        let outcome = orch.handle_message(&inbound("hello")).await;
        let TurnOutcome::Completed(report) = outcome else {
            panic!("expected completed turn, got {:?}", outcome);
        };
        assert_eq!(report.messages, 3);
        let sizes: Vec<_> = delivery
            .ops()
            .into_iter()
            .map(|op| match op {
                Op::Send { text, .. } => text.chars().count(),
                other => panic!("unexpected op {:?}", other),
            })
            .collect();
        assert_eq!(sizes[0], 2000);
        assert_eq!(sizes[1], 2000);
        assert!(sizes[2] > 500 && sizes[2] <= 2000);
    }

    #[tokio::test]
    async fn test_store_failure_after_delivery_is_not_fatal() {
        let provider = Arc::new(ScriptedProvider::streaming(&["Hi"]));
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(true), &provider, &delivery)
            .with_store(Arc::new(ReadOnlyStore::default()));

        let outcome = orch.handle_message(&inbound("hello")).await;
        let TurnOutcome::Completed(report) = outcome else {
            panic!("expected completed turn, got {:?}", outcome);
        };
        assert!(!report.recorded);
        assert_eq!(delivery.edits().len(), 1);
        assert!(!delivery.ops().iter().any(|op| matches!(op, Op::Notice(_))));
    }

    #[tokio::test]
    async fn test_history_optimized_after_turn() {
        let provider = Arc::new(ScriptedProvider::streaming(&["Hi", " there"]));
        let delivery = Arc::new(RecordingDelivery::default());
        let mut settings = settings(true);
        settings.history_token_limit = Some(10);
        let orch = orchestrator(settings, &provider, &delivery);

        orch.handle_message(&inbound("hello there")).await;
        // Both exchanges cost 7; only the newest fits below 10
        assert_eq!(
            history(&orch, "alice").await,
            vec![(Role::Assistant, "Hi there".to_string())]
        );
    }

    #[tokio::test]
    async fn test_clear_command() {
        let provider = Arc::new(ScriptedProvider::default());
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(true), &provider, &delivery);
        orch.store()
            .store("alice", &ChatMessage::user("remember me"), 3)
            .await
            .unwrap();

        let mut invocation = CommandInvocation {
            server_id: "guild".into(),
            user_id: "alice".into(),
            name: "forget".into(),
        };
        assert_eq!(orch.handle_command(&invocation).await.unwrap(), None);
        assert_eq!(history(&orch, "alice").await.len(), 1);

        invocation.name = "clear".into();
        let notice = orch.handle_command(&invocation).await.unwrap();
        assert_eq!(
            notice,
            Some(Notice::success(
                "✅ Cleared",
                "Your conversation context has been cleared."
            ))
        );
        assert!(history(&orch, "alice").await.is_empty());

        invocation.server_id = "other".into();
        assert_eq!(orch.handle_command(&invocation).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancelled_turn_records_nothing() {
        let provider = Arc::new(ScriptedProvider::with_stream(Box::pin(
            tokio_stream::pending::<relay_ai::Result<CompletionChunk>>(),
        )));
        let delivery = Arc::new(RecordingDelivery::default());
        let cancel = CancellationToken::new();
        let orch = orchestrator(settings(true), &provider, &delivery).with_cancel_token(cancel.clone());

        cancel.cancel();
        let outcome = orch.handle_message(&inbound("hello")).await;
        assert!(matches!(outcome, TurnOutcome::Failed(TurnError::Cancelled)));
        // The placeholder is closed, and no error notice follows
        assert_eq!(
            delivery.ops(),
            vec![
                placeholder("m0"),
                Op::Edit {
                    id: "m0".into(),
                    text: "⏹️ Response cancelled.".into()
                }
            ]
        );
        assert!(history(&orch, "alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_partial_text() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let stream = async_stream::stream! {
            yield Ok::<_, relay_ai::Error>(CompletionChunk::delta("Partial answer"));
            token.cancel();
            futures::future::pending::<()>().await;
        };
        let provider = Arc::new(ScriptedProvider::with_stream(Box::pin(stream)));
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(true), &provider, &delivery).with_cancel_token(cancel);

        let outcome = orch.handle_message(&inbound("hello")).await;
        assert!(matches!(outcome, TurnOutcome::Failed(TurnError::Cancelled)));
        assert_eq!(delivery.edits(), vec!["Partial answer".to_string()]);
        assert!(history(&orch, "alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_context_overflow_reported_as_token_limit() {
        let provider = Arc::new(ScriptedProvider::with_stream(Box::pin(tokio_stream::iter(vec![
            Err::<CompletionChunk, _>(relay_ai::Error::api(
                "invalid_request_error",
                "This model's maximum context length is 4097 tokens",
            )),
        ]))));
        let delivery = Arc::new(RecordingDelivery::default());
        let orch = orchestrator(settings(true), &provider, &delivery);

        let outcome = orch.handle_message(&inbound("hello")).await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed(TurnError::CompletionFailed(_))
        ));
        assert_eq!(
            delivery.ops().last(),
            Some(&Op::Notice(Notice::error(
                "Error",
                "Your message is too long for this channel's token limit."
            )))
        );
    }

    #[tokio::test]
    async fn test_default_tokenizer_rejects_dense_text() {
        let provider = Arc::new(ScriptedProvider::streaming(&["x"]));
        let delivery = Arc::new(RecordingDelivery::default());
        // No test tokenizer: counts come from the model's BPE vocabulary
        let orch = TurnOrchestrator::new(Arc::new(settings(true)), provider.clone(), delivery.clone());

        let text: String = (0x4E00u32..0x4E00 + 1900).filter_map(char::from_u32).collect();
        let outcome = orch.handle_message(&inbound(&text)).await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed(TurnError::TokenLimitExceeded { limit: 500, .. })
        ));
        assert!(provider.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_while_provider_stalls() {
        let stream = async_stream::stream! {
            yield Ok::<_, relay_ai::Error>(CompletionChunk::delta("Hello"));
            tokio::time::sleep(Duration::from_millis(50)).await;
            yield Ok(CompletionChunk::delta(" world"));
        };
        let provider = Arc::new(ScriptedProvider::with_stream(Box::pin(stream)));
        let delivery = Arc::new(RecordingDelivery::default());
        let channel = ChannelSettings {
            message_edit_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let orch = orchestrator(settings_with(true, channel), &provider, &delivery);

        let outcome = orch.handle_message(&inbound("hello")).await;
        assert!(matches!(outcome, TurnOutcome::Completed(_)));

        let edits = delivery.edits();
        assert_eq!(edits.len(), 3);
        assert_eq!(edits[0], "Hello");
        assert_eq!(edits[1], "Hello world");
        assert!(edits[2].starts_with("Hello world\n\n💠"));
    }
}
