use axum::extract::FromRef;

use crate::chat::ChatProtocol;
use crate::user::UserStore;
use std::sync::Arc;
use std::time::Instant;

use super::websocket::ConnectionRegistry;
use super::ServerConfig;

pub type GuardedChatProtocol = Arc<ChatProtocol>;
pub type GuardedUserStore = Arc<dyn UserStore>;
pub type GuardedConnectionRegistry = Arc<ConnectionRegistry>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub hash: String,
    pub protocol: GuardedChatProtocol,
    pub user_store: GuardedUserStore,
    pub connections: GuardedConnectionRegistry,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        protocol: GuardedChatProtocol,
        user_store: GuardedUserStore,
    ) -> Self {
        ServerState {
            config,
            start_time: Instant::now(),
            hash: env!("GIT_HASH").to_string(),
            protocol,
            user_store,
            connections: Arc::new(ConnectionRegistry::new()),
        }
    }
}

impl FromRef<ServerState> for GuardedChatProtocol {
    fn from_ref(input: &ServerState) -> Self {
        input.protocol.clone()
    }
}

impl FromRef<ServerState> for GuardedUserStore {
    fn from_ref(input: &ServerState) -> Self {
        input.user_store.clone()
    }
}

impl FromRef<ServerState> for GuardedConnectionRegistry {
    fn from_ref(input: &ServerState) -> Self {
        input.connections.clone()
    }
}
