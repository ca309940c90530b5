//! Registry of open chat connections.
//!
//! Connections are keyed by a per-connection id, since several connections may share one
//! chat session. The registry feeds the connections gauge and the status route.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::server::metrics;
use crate::user::UserId;

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub user_id: Option<UserId>,
    /// Bound once Connect resolved the session.
    pub session_id: Option<String>,
    pub connected_at: i64,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionInfo>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the id to unregister the connection with.
    pub async fn register(&self, user_id: Option<UserId>) -> String {
        let connection_id = Uuid::new_v4().to_string();
        let mut conns = self.connections.write().await;
        conns.insert(
            connection_id.clone(),
            ConnectionInfo {
                user_id,
                session_id: None,
                connected_at: chrono::Utc::now().timestamp(),
            },
        );
        metrics::set_ws_connections(conns.len());
        connection_id
    }

    pub async fn bind_session(&self, connection_id: &str, session_id: &str) {
        let mut conns = self.connections.write().await;
        if let Some(info) = conns.get_mut(connection_id) {
            info.session_id = Some(session_id.to_string());
        }
    }

    pub async fn unregister(&self, connection_id: &str) {
        let mut conns = self.connections.write().await;
        conns.remove(connection_id);
        metrics::set_ws_connections(conns.len());
    }

    pub async fn get(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let first = registry.register(Some(1)).await;
        let second = registry.register(None).await;
        assert_ne!(first, second);
        assert_eq!(registry.count().await, 2);

        registry.unregister(&first).await;
        assert_eq!(registry.count().await, 1);
        assert!(registry.get(&first).await.is_none());
        assert_eq!(registry.get(&second).await.unwrap().user_id, None);
    }

    #[tokio::test]
    async fn sessions_are_bound_per_connection() {
        let registry = ConnectionRegistry::new();
        let first = registry.register(Some(1)).await;
        let second = registry.register(Some(1)).await;
        registry.bind_session(&first, "s-1").await;
        registry.bind_session(&second, "s-1").await;

        assert_eq!(
            registry.get(&first).await.unwrap().session_id.as_deref(),
            Some("s-1")
        );
        assert_eq!(
            registry.get(&second).await.unwrap().session_id.as_deref(),
            Some("s-1")
        );
    }

    #[tokio::test]
    async fn unknown_connection_is_ignored() {
        let registry = ConnectionRegistry::new();
        registry.bind_session("missing", "s-1").await;
        registry.unregister("missing").await;
        assert_eq!(registry.count().await, 0);
    }
}
