//! Shape of the replies the assistant is allowed to send back to a chat client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Actions the client application knows how to act on.
pub const SUPPORTED_FEATURES: &[&str] = &[
    "escalate_crisis",
    "suggest_test_phq9",
    "suggest_test_gad7",
    "suggest_test_pss",
    "end_conversation",
];

pub const ESCALATE_CRISIS: &str = "escalate_crisis";
pub const PLEASE_REPEAT: &str = "Sorry, an error occurred. Could you please repeat your question?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyType {
    Action,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    #[serde(rename = "type")]
    pub reply_type: ReplyType,
    pub data: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("Reply is not a valid reply object: {0}")]
    Malformed(String),
    #[error("Unsupported action {0}")]
    UnsupportedAction(String),
    #[error("Text reply is empty")]
    EmptyText,
}

impl ChatReply {
    pub fn action(data: impl Into<String>) -> Self {
        Self {
            reply_type: ReplyType::Action,
            data: data.into(),
        }
    }

    pub fn parse(content: &str) -> Result<Self, ReplyError> {
        let reply: ChatReply =
            serde_json::from_str(content).map_err(|e| ReplyError::Malformed(e.to_string()))?;
        match reply.reply_type {
            ReplyType::Action if !SUPPORTED_FEATURES.contains(&reply.data.as_str()) => {
                Err(ReplyError::UnsupportedAction(reply.data))
            }
            ReplyType::Text if reply.data.trim().is_empty() => Err(ReplyError::EmptyText),
            _ => Ok(reply),
        }
    }

    /// Wire form, `{"type":..,"data":..}` in that key order.
    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
