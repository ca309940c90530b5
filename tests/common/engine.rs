//! Deterministic conversation engine for end-to-end tests
//!
//! Replies `{"type":"text","data":"echo: <message>"}` and writes both turns through the
//! history manager. A few magic messages (see constants) trigger the failure paths.

use super::constants::*;
use async_trait::async_trait;
use chat_session_server::conversation::{
    ChatMessage, Conversation, ConversationEngine, EngineError, HistoryManager, TokenUsage,
};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
pub struct ScriptedEngine {
    closed: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    /// Conversation ids the server closed so far
    #[allow(dead_code)]
    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

struct ScriptedConversation {
    id: String,
    history: Arc<dyn HistoryManager>,
    usage: TokenUsage,
}

#[async_trait]
impl Conversation for ScriptedConversation {
    async fn request(&mut self, message: ChatMessage) -> Result<ChatMessage, EngineError> {
        let content = match message.content.as_str() {
            BLOCKED_PROMPT => return Err(EngineError::PromptBlocked("scripted".to_string())),
            EMPTY_REPLY_PROMPT => return Err(EngineError::EmptyResponse),
            INVALID_REPLY_PROMPT => r#"{"type":"action","data":"dance"}"#.to_string(),
            text => serde_json::json!({ "type": "text", "data": format!("echo: {}", text) })
                .to_string(),
        };

        let reply = ChatMessage::assistant(&self.id, Uuid::new_v4().to_string(), content);
        self.history.add(&[message, reply.clone()]);
        self.usage.total_tokens += 1;
        Ok(reply)
    }

    fn usage(&self) -> TokenUsage {
        self.usage
    }
}

#[async_trait]
impl ConversationEngine for ScriptedEngine {
    async fn start_conversation(
        &self,
        history: Arc<dyn HistoryManager>,
        _instruction_key: &str,
        conversation_id: &str,
    ) -> Result<Box<dyn Conversation>, EngineError> {
        Ok(Box::new(ScriptedConversation {
            id: conversation_id.to_string(),
            history,
            usage: TokenUsage::default(),
        }))
    }

    async fn close(&self, conversation_id: &str) -> Result<(), EngineError> {
        self.closed.lock().unwrap().push(conversation_id.to_string());
        Ok(())
    }
}
