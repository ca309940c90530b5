//! Clients for end-to-end tests
//!
//! `TestClient` wraps reqwest for the HTTP routes, `ChatClient` wraps a tokio-tungstenite
//! websocket speaking the chat envelope format.
//!
//! When API routes or frame formats change, update only this file.

use super::constants::*;
use futures::{SinkExt, StreamExt};
use reqwest::Response;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// HTTP test client sending a bearer token, when it has one
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
    token: Option<String>,
}

#[allow(dead_code)]
impl TestClient {
    /// Creates a new unauthenticated client
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self {
            client,
            base_url,
            token: None,
        }
    }

    /// Creates a client authenticated with `token`
    pub fn authenticated(base_url: String, token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            ..Self::new(base_url)
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// GET /
    pub async fn home(&self) -> Response {
        self.client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .expect("Home request failed")
    }

    /// POST /v1/chats/{session_id}/archive
    pub async fn archive_chat(&self, session_id: &str) -> Response {
        self.post(&format!("/v1/chats/{}/archive", session_id))
            .send()
            .await
            .expect("Archive request failed")
    }
}

/// A frame received by [`ChatClient`]
#[derive(Debug)]
pub enum ClientFrame {
    /// A text frame, parsed as JSON
    Json(Value),
    /// A close frame with its code and reason, or the end of the stream
    Closed(Option<(u16, String)>),
}

impl ClientFrame {
    /// The JSON body, panicking on anything else
    pub fn json(self) -> Value {
        match self {
            ClientFrame::Json(value) => value,
            other => panic!("Expected a JSON frame, got {:?}", other),
        }
    }
}

/// Websocket client of the chat endpoint
pub struct ChatClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[allow(dead_code)]
impl ChatClient {
    /// Connects to `url`, sending `token` as a bearer token when given
    pub async fn connect(url: &str, token: Option<&str>) -> Self {
        let mut request = url
            .into_client_request()
            .expect("Failed to build websocket request");
        if let Some(token) = token {
            request.headers_mut().insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
            );
        }

        let (ws, _) = connect_async(request)
            .await
            .expect("Failed to connect to websocket");
        Self { ws }
    }

    /// Connects with the token sent as the `session_token` cookie
    pub async fn connect_with_cookie(url: &str, token: &str) -> Self {
        let mut request = url
            .into_client_request()
            .expect("Failed to build websocket request");
        request.headers_mut().insert(
            "Cookie",
            HeaderValue::from_str(&format!("session_token={}", token)).unwrap(),
        );

        let (ws, _) = connect_async(request)
            .await
            .expect("Failed to connect to websocket");
        Self { ws }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .expect("Failed to send frame");
    }

    /// Sends a chat message envelope
    pub async fn send_chat(&mut self, text: &str) {
        self.send_json(json!({ "action": "chat", "payload": text }))
            .await;
    }

    /// Sends the heartbeat envelope browsers use
    pub async fn send_heartbeat(&mut self) {
        self.send_json(json!({ "action": "ping" })).await;
    }

    /// Sends a websocket ping frame
    pub async fn send_ping_frame(&mut self) {
        self.ws
            .send(Message::Ping(Vec::<u8>::new().into()))
            .await
            .expect("Failed to send ping");
    }

    pub async fn send_raw_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("Failed to send frame");
    }

    /// Next text or close frame, `None` if nothing arrives in time
    pub async fn next_frame_within(&mut self, wait: Duration) -> Option<ClientFrame> {
        let result = timeout(wait, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let value = serde_json::from_str::<Value>(text.as_str())
                            .expect("Server sent a non JSON text frame");
                        return ClientFrame::Json(value);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return ClientFrame::Closed(
                            frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string())),
                        );
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => return ClientFrame::Closed(None),
                }
            }
        })
        .await;

        result.ok()
    }

    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        self.next_frame_within(Duration::from_millis(FRAME_TIMEOUT_MS))
            .await
    }

    /// Next frame, which must be JSON
    pub async fn expect_json(&mut self) -> Value {
        self.next_frame()
            .await
            .expect("No frame received in time")
            .json()
    }

    /// Asserts that nothing arrives for `wait`
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Some(frame) = self.next_frame_within(wait).await {
            panic!("Expected no frame, got {:?}", frame);
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
