//! Connect / message / ping / close handling for a chat connection.
//!
//! Every operation returns a [`ProtocolResponse`] for the transport to act on. The
//! transport decides how to surface errors; user-facing failures of the engine are turned
//! into fixed payloads here and never leave as raw errors.

use super::finalizer::{FinalizeParams, CHAT_JOB_TYPE};
use super::history::ChatHistoryManager;
use super::models::{MessageGate, SessionState};
use super::reply::{ChatReply, ReplyError, ESCALATE_CRISIS, PLEASE_REPEAT};
use super::store::ChatStateGateway;
use crate::conversation::{ChatMessage, ConversationEngine, EngineError};
use crate::future_jobs::JobStore;
use crate::server::metrics;
use crate::user::{UserId, UserStore};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const NOTIFY_NEW_CONVERSATION: &str = "new_conversation";
pub const NOTIFY_EXISTING_CONVERSATION: &str = "existing_conversation";
pub const NOTIFY_CONVERSATION_FINISHED: &str = "conversation_finished";
pub const NOTIFY_CONVERSATION_ARCHIVED: &str = "conversation_archived";

const CHAT_ACTION: &str = "chat";
const PING_ACTION: &str = "ping";
const NO_PAYLOAD: &str = "none";

#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// Inactivity after which a session is finished.
    pub idle_timeout: Duration,
    /// Instruction set the engine is started with.
    pub instruction_key: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            instruction_key: "interactive_chat".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseAction {
    Data,
    Notify,
    Reject,
    Noop,
}

impl ResponseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseAction::Data => "data",
            ResponseAction::Notify => "notify",
            ResponseAction::Reject => "reject",
            ResponseAction::Noop => "noop",
        }
    }
}

/// Outbound envelope. `quiet` and `close` steer the transport and are never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolResponse {
    pub action: ResponseAction,
    pub payload: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(skip)]
    pub quiet: bool,
    #[serde(skip)]
    pub close: bool,
}

impl ProtocolResponse {
    fn new(action: ResponseAction, payload: impl Into<String>, session_id: &str) -> Self {
        Self {
            action,
            payload: payload.into(),
            session_id: session_id.to_string(),
            message_id: Uuid::new_v4().to_string(),
            quiet: false,
            close: false,
        }
    }

    pub fn notify(session_id: &str, payload: &str) -> Self {
        Self::new(ResponseAction::Notify, payload, session_id)
    }

    pub fn data(session_id: &str, message_id: &str, payload: impl Into<String>) -> Self {
        Self {
            message_id: message_id.to_string(),
            ..Self::new(ResponseAction::Data, payload, session_id)
        }
    }

    /// Sent, then the connection is closed.
    pub fn closing(session_id: &str, action: ResponseAction, payload: &str) -> Self {
        Self {
            close: true,
            ..Self::new(action, payload, session_id)
        }
    }

    /// Not sent.
    pub fn noop(session_id: &str) -> Self {
        Self {
            quiet: true,
            ..Self::new(ResponseAction::Noop, NO_PAYLOAD, session_id)
        }
    }

    /// Not sent, and the connection is closed.
    pub fn reject(session_id: &str) -> Self {
        Self {
            quiet: true,
            close: true,
            ..Self::new(ResponseAction::Reject, NO_PAYLOAD, session_id)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    /// Session id proposed by the client, or a fresh one.
    pub connect_id: String,
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRequest {
    pub action: String,
    pub payload: Value,
    pub session_id: String,
    pub message_id: String,
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingRequest {
    pub session_id: String,
    pub message_id: String,
    pub user_id: Option<UserId>,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid action {0}")]
    InvalidAction(String),
    #[error("Payload is empty")]
    EmptyPayload,
    #[error("Chat {0} not found")]
    SessionNotFound(String),
    #[error("Invalid engine reply: {0}")]
    InvalidReply(#[from] ReplyError),
    #[error("Engine failure: {0}")]
    Engine(#[from] EngineError),
    #[error("Storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub struct ChatProtocol {
    chats: Arc<dyn ChatStateGateway>,
    users: Arc<dyn UserStore>,
    jobs: Arc<dyn JobStore>,
    engine: Arc<dyn ConversationEngine>,
    settings: ChatSettings,
}

impl ChatProtocol {
    pub fn new(
        chats: Arc<dyn ChatStateGateway>,
        users: Arc<dyn UserStore>,
        jobs: Arc<dyn JobStore>,
        engine: Arc<dyn ConversationEngine>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            chats,
            users,
            jobs,
            engine,
            settings,
        }
    }

    pub fn chats(&self) -> &Arc<dyn ChatStateGateway> {
        &self.chats
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Resolves the session a new connection is bound to. The returned response carries
    /// the session id the connection must use from then on.
    pub async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<ProtocolResponse, ProtocolError> {
        let result = self.handle_connect(request);
        record("connect", &result);
        result
    }

    pub async fn message(
        &self,
        request: MessageRequest,
    ) -> Result<ProtocolResponse, ProtocolError> {
        let result = self.handle_message(request).await;
        record("message", &result);
        result
    }

    pub async fn ping(&self, request: PingRequest) -> Result<ProtocolResponse, ProtocolError> {
        let result = self.handle_ping(request);
        record("ping", &result);
        result
    }

    /// Releases engine resources of the session. Never touches the session row.
    pub async fn close(&self, session_id: &str) {
        metrics::record_protocol_event("close", "ok");
        if let Err(e) = self.engine.close(session_id).await {
            error!("Failed to close conversation {}: {}", session_id, e);
        }
    }

    fn authorize(&self, user_id: Option<UserId>) -> Result<Option<UserId>, ProtocolError> {
        let Some(user_id) = user_id else {
            return Ok(None);
        };
        if self.users.user_exists(user_id)? {
            Ok(Some(user_id))
        } else {
            Ok(None)
        }
    }

    fn handle_connect(&self, request: ConnectRequest) -> Result<ProtocolResponse, ProtocolError> {
        let Some(user_id) = self.authorize(request.user_id)? else {
            info!("Unauthorized connect for {}", request.connect_id);
            return Ok(ProtocolResponse::reject(&request.connect_id));
        };

        let mut connect_id = request.connect_id;
        if let Some(requested) = self.chats.get_session(&connect_id)? {
            if requested.user_id != user_id {
                warn!(
                    "User {} asked for chat {} owned by someone else",
                    user_id, connect_id
                );
                connect_id = Uuid::new_v4().to_string();
            } else if requested.state() == SessionState::Archived {
                info!("Chat {} is archived, closing connection", connect_id);
                return Ok(ProtocolResponse::closing(
                    &connect_id,
                    ResponseAction::Notify,
                    NOTIFY_CONVERSATION_ARCHIVED,
                ));
            }
        }

        let Some(session) = self.chats.latest_open_session(user_id)? else {
            self.chats.create_session(user_id, &connect_id)?;
            info!("Started chat {} for user {}", connect_id, user_id);
            return Ok(ProtocolResponse::notify(
                &connect_id,
                NOTIFY_NEW_CONVERSATION,
            ));
        };

        debug!(
            "User {} rejoins chat {} ({:?})",
            user_id,
            session.session_id,
            session.state()
        );
        let payload = match session.state() {
            SessionState::Finished => NOTIFY_CONVERSATION_FINISHED,
            _ => NOTIFY_EXISTING_CONVERSATION,
        };
        Ok(ProtocolResponse::notify(&session.session_id, payload))
    }

    async fn handle_message(
        &self,
        request: MessageRequest,
    ) -> Result<ProtocolResponse, ProtocolError> {
        let session_id = request.session_id.as_str();
        let Some(user_id) = self.authorize(request.user_id)? else {
            info!("Unauthorized message on {}", session_id);
            return Ok(ProtocolResponse::reject(session_id));
        };

        if request.action != CHAT_ACTION {
            if request.action == PING_ACTION {
                return Ok(ProtocolResponse::noop(session_id));
            }
            return Err(ProtocolError::InvalidAction(request.action));
        }

        let content = match &request.payload {
            Value::String(content) if !content.is_empty() => content.as_str(),
            _ => return Err(ProtocolError::EmptyPayload),
        };

        match self.chats.reactivate_for_message(user_id, session_id)? {
            MessageGate::Missing => {
                return Err(ProtocolError::SessionNotFound(session_id.to_string()))
            }
            MessageGate::Archived => {
                info!("Rejecting message on archived chat {}", session_id);
                return Ok(ProtocolResponse::reject(session_id));
            }
            MessageGate::Reactivated(_) => info!("Chat {} reactivated by a message", session_id),
            MessageGate::Active(_) => {}
        }

        self.arm_idle_timer(user_id, session_id)?;

        let history = Arc::new(ChatHistoryManager::new(self.chats.clone(), session_id));
        let mut conversation = self
            .engine
            .start_conversation(history, &self.settings.instruction_key, session_id)
            .await?;

        let outcome = conversation
            .request(ChatMessage::user(session_id, &request.message_id, content))
            .await;
        match outcome {
            Ok(reply) => {
                ChatReply::parse(&reply.content)?;
                debug!("Chat {} reply {}: {}", session_id, reply.id, reply.content);
                Ok(ProtocolResponse::data(session_id, &reply.id, reply.content))
            }
            Err(e) => {
                metrics::record_engine_failure(e.kind());
                match e {
                    EngineError::PromptBlocked(_) | EngineError::ContentBlocked(_) => {
                        info!("Chat {} blocked by the engine: {}", session_id, e);
                        fixed_reply(session_id, ESCALATE_CRISIS)
                    }
                    EngineError::EmptyResponse => {
                        info!("Empty engine reply on chat {}", session_id);
                        fixed_reply(session_id, PLEASE_REPEAT)
                    }
                    EngineError::Other(_) => Err(e.into()),
                }
            }
        }
    }

    fn handle_ping(&self, request: PingRequest) -> Result<ProtocolResponse, ProtocolError> {
        let session_id = request.session_id.as_str();
        let Some(user_id) = self.authorize(request.user_id)? else {
            info!("Unauthorized ping on {}", session_id);
            return Ok(ProtocolResponse::reject(session_id));
        };

        let Some(session) = self.chats.get_user_session(user_id, session_id)? else {
            return Err(ProtocolError::SessionNotFound(session_id.to_string()));
        };

        Ok(match session.state() {
            SessionState::Archived => ProtocolResponse::closing(
                session_id,
                ResponseAction::Notify,
                NOTIFY_CONVERSATION_ARCHIVED,
            ),
            SessionState::Finished => {
                ProtocolResponse::notify(session_id, NOTIFY_CONVERSATION_FINISHED)
            }
            SessionState::Active => ProtocolResponse::noop(session_id),
        })
    }

    /// Pushes the idle timer of the session `idle_timeout` into the future, creating it
    /// when missing and re-arming it when it already ran.
    fn arm_idle_timer(&self, user_id: UserId, session_id: &str) -> Result<(), ProtocolError> {
        let params = serde_json::to_string(&FinalizeParams {
            user_id,
            conversation_id: session_id.to_string(),
        })
        .map_err(anyhow::Error::from)?;
        let job = self.jobs.upsert_schedule(
            CHAT_JOB_TYPE,
            &params,
            self.settings.idle_timeout,
            session_id,
        )?;
        debug!(
            "Idle timer {} of chat {} due at {}",
            job.id, session_id, job.triggered_at
        );
        Ok(())
    }
}

fn fixed_reply(session_id: &str, data: &str) -> Result<ProtocolResponse, ProtocolError> {
    let payload = ChatReply::action(data)
        .to_payload()
        .map_err(anyhow::Error::from)?;
    Ok(ProtocolResponse::data(
        session_id,
        &Uuid::new_v4().to_string(),
        payload,
    ))
}

fn record(event: &str, result: &Result<ProtocolResponse, ProtocolError>) {
    let outcome = match result {
        Ok(response) => response.action.as_str(),
        Err(_) => "error",
    };
    metrics::record_protocol_event(event, outcome);
}
