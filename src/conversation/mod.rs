//! Conversation engine abstraction.
//!
//! The chat protocol only talks to [`ConversationEngine`]; history storage is injected
//! through [`HistoryManager`] so engines never touch the database themselves.

mod engine;
mod openai;

pub use engine::{
    ChatMessage, Conversation, ConversationEngine, EngineError, HistoryManager, MessageRole,
    TokenUsage,
};
pub use openai::{ApiKeySource, OpenAIEngine, OpenAIEngineSettings};
