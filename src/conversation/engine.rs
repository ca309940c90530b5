//! Types shared by conversation engines and the chat protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "system" => Some(MessageRole::System),
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub conversation_id: String,
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ChatMessage {
    pub fn user(
        conversation_id: impl Into<String>,
        id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            id: id.into(),
            role: MessageRole::User,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn assistant(
        conversation_id: impl Into<String>,
        id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            id: id.into(),
            role: MessageRole::Assistant,
            content: content.into(),
            metadata: Map::new(),
        }
    }
}

/// Token accounting reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Failure taxonomy of a conversation request.
///
/// Callers facing end users map the blocked and empty cases to fixed payloads and
/// never show the inner message.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Prompt blocked: {0}")]
    PromptBlocked(String),
    #[error("Content blocked: {0}")]
    ContentBlocked(String),
    #[error("Empty response")]
    EmptyResponse,
    #[error("Engine error: {0}")]
    Other(String),
}

impl EngineError {
    /// Metric label for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::PromptBlocked(_) => "prompt_blocked",
            EngineError::ContentBlocked(_) => "content_blocked",
            EngineError::EmptyResponse => "empty_response",
            EngineError::Other(_) => "other",
        }
    }
}

/// Storage seam for conversation history, keyed by conversation id.
pub trait HistoryManager: Send + Sync {
    /// Persists `messages`. Failures are logged by the implementation, never returned.
    fn add(&self, messages: &[ChatMessage]);

    /// Messages of `conversation_id` in insertion order.
    fn get(&self, conversation_id: &str) -> Vec<ChatMessage>;
}

#[async_trait]
pub trait Conversation: Send {
    async fn request(&mut self, message: ChatMessage) -> Result<ChatMessage, EngineError>;

    fn usage(&self) -> TokenUsage;
}

#[async_trait]
pub trait ConversationEngine: Send + Sync {
    async fn start_conversation(
        &self,
        history: Arc<dyn HistoryManager>,
        instruction_key: &str,
        conversation_id: &str,
    ) -> Result<Box<dyn Conversation>, EngineError>;

    /// Releases whatever the engine keeps for `conversation_id`.
    async fn close(&self, conversation_id: &str) -> Result<(), EngineError>;
}
