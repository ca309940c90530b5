//! Wire envelopes of the chat websocket.

use crate::chat::ProtocolResponse;
use serde::Deserialize;

/// Action of a text envelope that is handled as a heartbeat.
pub const HEARTBEAT_ACTION: &str = "ping";

pub const SERVER_REQUESTED: &str = "server requested";
pub const FAILED_TO_CONNECT: &str = "failed to connect";

/// Client -> Server envelope.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClientEnvelope {
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ClientEnvelope {
    pub fn parse(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.action == HEARTBEAT_ACTION
    }
}

/// Server -> Client frame body. Only `{action, payload, session_id, message_id}` is
/// written; the control flags stay server side.
pub fn encode_response(response: &ProtocolResponse) -> serde_json::Result<String> {
    serde_json::to_string(response)
}

pub fn close_reason(reason: &str) -> String {
    format!("connection closed by server: {}", reason)
}
