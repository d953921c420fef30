//! relay-chat: the chat side of the bot
//!
//! Per-identity conversation memory with token budgets, assembly of
//! streamed completions into platform-sized messages, and the turn
//! orchestrator tying a provider, a store and a chat platform together.

pub mod assembler;
pub mod delivery;
pub mod error;
pub mod locale;
pub mod orchestrator;
pub mod settings;
pub mod store;

pub use assembler::{AssemblerState, ChunkPolicy, Emission, StreamAssembler, Target};
pub use delivery::{Delivery, MessageHandle, Notice, NoticeKind};
pub use error::{DeliveryError, StoreError, TurnError};
pub use locale::{InvalidLanguage, Language, Localizer};
pub use orchestrator::{
    CommandInvocation, InboundMessage, TurnOrchestrator, TurnOutcome, TurnReport,
};
pub use settings::{ChannelSettings, ClearContextSettings, ServerSettings, Settings};
pub use store::{ConversationStore, Exchange, Fetched, MemoryStore};
