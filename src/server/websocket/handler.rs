//! WebSocket route handler.
//!
//! Handles the upgrade, the Connect handshake, the frame loop and cleanup.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::messages::{
    close_reason, encode_response, ClientEnvelope, FAILED_TO_CONNECT, SERVER_REQUESTED,
};
use crate::chat::{ConnectRequest, MessageRequest, PingRequest, ProtocolResponse};
use crate::server::session::Session;
use crate::server::state::{GuardedChatProtocol, GuardedConnectionRegistry};
use crate::user::UserId;

type WsSink = SplitSink<WebSocket, Message>;

#[derive(Debug, Deserialize)]
pub struct ChatWsParams {
    pub session_id: Option<String>,
}

/// Route handler for `GET /v1/chat/ws`.
///
/// Upgrades without a session too: Connect is the one rejecting them, over the socket.
pub async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ChatWsParams>,
    session: Option<Session>,
    State(protocol): State<GuardedChatProtocol>,
    State(connections): State<GuardedConnectionRegistry>,
) -> Response {
    let connect_id = params
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let user_id = session.map(|s| s.user_id);

    debug!("Chat websocket upgrade for {} (user {:?})", connect_id, user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, connect_id, user_id, protocol, connections))
}

async fn handle_socket(
    socket: WebSocket,
    connect_id: String,
    user_id: Option<UserId>,
    protocol: GuardedChatProtocol,
    connections: GuardedConnectionRegistry,
) {
    let connection_id = connections.register(user_id).await;
    let (mut ws_sink, ws_stream) = socket.split();

    let session_id = match protocol
        .connect(ConnectRequest {
            connect_id: connect_id.clone(),
            user_id,
        })
        .await
    {
        Ok(response) => {
            let session_id = response.session_id.clone();
            connections.bind_session(&connection_id, &session_id).await;
            if deliver(&mut ws_sink, &response).await {
                Some(session_id)
            } else {
                None
            }
        }
        Err(e) => {
            error!("Connect failed for {}: {}", connect_id, e);
            send_close(&mut ws_sink, close_code::PROTOCOL, FAILED_TO_CONNECT).await;
            None
        }
    };

    if let Some(session_id) = &session_id {
        info!("Chat websocket connected to {}", session_id);
        process_incoming(ws_stream, &mut ws_sink, session_id, user_id, &protocol).await;
    }

    protocol
        .close(session_id.as_deref().unwrap_or(&connect_id))
        .await;
    connections.unregister(&connection_id).await;
    debug!("Chat websocket {} disconnected", connection_id);
}

/// Runs Message and Ping until the client leaves or a response asks to close.
async fn process_incoming(
    mut ws_stream: SplitStream<WebSocket>,
    ws_sink: &mut WsSink,
    session_id: &str,
    user_id: Option<UserId>,
    protocol: &GuardedChatProtocol,
) {
    while let Some(result) = ws_stream.next().await {
        let message_id = Uuid::new_v4().to_string();
        let outcome = match result {
            Ok(Message::Text(text)) => {
                handle_frame(text.as_bytes(), session_id, message_id, user_id, protocol).await
            }
            Ok(Message::Binary(data)) => {
                handle_frame(&data, session_id, message_id, user_id, protocol).await
            }
            Ok(Message::Ping(_)) => {
                handle_ping(session_id, message_id, user_id, protocol).await
            }
            Ok(Message::Pong(_)) => {
                debug!("Received pong");
                None
            }
            Ok(Message::Close(_)) => {
                debug!("Received close frame on {}", session_id);
                break;
            }
            Err(e) => {
                debug!("WebSocket error on {}: {}", session_id, e);
                break;
            }
        };

        if let Some(response) = outcome {
            if !deliver(ws_sink, &response).await {
                break;
            }
        }
    }
}

async fn handle_frame(
    data: &[u8],
    session_id: &str,
    message_id: String,
    user_id: Option<UserId>,
    protocol: &GuardedChatProtocol,
) -> Option<ProtocolResponse> {
    let envelope = match ClientEnvelope::parse(data) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Unreadable frame on {}: {}", session_id, e);
            return None;
        }
    };

    if envelope.is_heartbeat() {
        return handle_ping(session_id, message_id, user_id, protocol).await;
    }

    let request = MessageRequest {
        action: envelope.action,
        payload: envelope.payload,
        session_id: session_id.to_string(),
        message_id,
        user_id,
    };
    match protocol.message(request).await {
        Ok(response) => Some(response),
        Err(e) => {
            error!("Message on {} failed: {}", session_id, e);
            None
        }
    }
}

async fn handle_ping(
    session_id: &str,
    message_id: String,
    user_id: Option<UserId>,
    protocol: &GuardedChatProtocol,
) -> Option<ProtocolResponse> {
    let request = PingRequest {
        session_id: session_id.to_string(),
        message_id,
        user_id,
    };
    match protocol.ping(request).await {
        Ok(response) => Some(response),
        Err(e) => {
            error!("Ping on {} failed: {}", session_id, e);
            None
        }
    }
}

/// Writes `response` unless it is quiet, then closes when asked to.
/// Returns whether the connection is still usable.
async fn deliver(ws_sink: &mut WsSink, response: &ProtocolResponse) -> bool {
    if !response.quiet {
        match encode_response(response) {
            Ok(json) => {
                if ws_sink.send(Message::Text(json.into())).await.is_err() {
                    return false;
                }
            }
            Err(e) => error!("Failed to serialize chat response: {}", e),
        }
    }

    if response.close {
        send_close(ws_sink, close_code::NORMAL, SERVER_REQUESTED).await;
        return false;
    }
    true
}

async fn send_close(ws_sink: &mut WsSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: close_reason(reason).into(),
    };
    if let Err(e) = ws_sink.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}
