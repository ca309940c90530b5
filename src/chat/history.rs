use super::store::ChatStateGateway;
use crate::conversation::{ChatMessage, HistoryManager};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Bridges a conversation engine to the chat history table.
///
/// Every added message is also kept in memory, and reads fall back to that copy when the
/// store cannot be queried.
pub struct ChatHistoryManager {
    store: Arc<dyn ChatStateGateway>,
    session_id: String,
    memory_cache: Mutex<Vec<ChatMessage>>,
}

impl ChatHistoryManager {
    pub fn new(store: Arc<dyn ChatStateGateway>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            memory_cache: Mutex::new(Vec::new()),
        }
    }
}

impl HistoryManager for ChatHistoryManager {
    fn add(&self, messages: &[ChatMessage]) {
        self.memory_cache
            .lock()
            .unwrap()
            .extend(messages.iter().cloned());
        if let Err(e) = self.store.append_history(&self.session_id, messages) {
            warn!(
                "Failed to store {} history messages of chat {}: {:#}",
                messages.len(),
                self.session_id,
                e
            );
        }
    }

    fn get(&self, conversation_id: &str) -> Vec<ChatMessage> {
        match self.store.history(conversation_id) {
            Ok(messages) => {
                debug!(
                    "Found {} history messages for chat {}",
                    messages.len(),
                    conversation_id
                );
                messages
            }
            Err(e) => {
                warn!(
                    "Failed to read history of chat {}, using memory cache: {:#}",
                    conversation_id, e
                );
                self.memory_cache.lock().unwrap().clone()
            }
        }
    }
}
