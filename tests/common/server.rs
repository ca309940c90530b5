//! Test server lifecycle management
//!
//! This module manages spawning and shutting down test HTTP servers.
//! Each test gets an isolated server with its own databases and scheduler.

use super::constants::*;
use super::engine::ScriptedEngine;
use chat_session_server::chat::{ChatSettings, SessionFinalizer, SqliteChatStore, CHAT_JOB_TYPE};
use chat_session_server::future_jobs::{
    FutureScheduler, SchedulerHandle, SchedulerSettings, SqliteJobStore,
};
use chat_session_server::server::{make_app, RequestsLoggingLevel, ServerConfig, ServerState};
use chat_session_server::user::{SqliteUserStore, UserId, UserStore};
use chat_session_server::ChatProtocol;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance with isolated databases
///
/// When dropped, the server gracefully shuts down and temp resources are cleaned up.
#[allow(dead_code)]
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Stores for direct database access in tests
    pub user_store: Arc<SqliteUserStore>,
    pub chat_store: Arc<SqliteChatStore>,
    pub job_store: Arc<SqliteJobStore>,

    pub engine: Arc<ScriptedEngine>,

    /// Bearer token and id of TEST_USER
    pub token: String,
    pub user_id: UserId,

    /// Bearer token of OTHER_USER
    pub other_token: String,

    // Private fields - keep resources alive until drop
    _temp_db_dir: TempDir,
    _scheduler: SchedulerHandle,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a new test server on a random port
    ///
    /// This function:
    /// 1. Creates temporary job, chat and user databases
    /// 2. Seeds TEST_USER and OTHER_USER with a token each
    /// 3. Starts a fast scheduler with the session finalizer
    /// 4. Binds to a random port (127.0.0.1:0) and serves the app
    /// 5. Waits for the server to be ready
    ///
    /// # Panics
    ///
    /// Panics if any of the steps above fails.
    pub async fn spawn() -> Self {
        let temp_db_dir = TempDir::new().expect("Failed to create temp dir");
        let db_dir = temp_db_dir.path();

        let user_store = Arc::new(
            SqliteUserStore::new(db_dir.join("user.db")).expect("Failed to open user store"),
        );
        let chat_store = Arc::new(
            SqliteChatStore::new(db_dir.join("chat.db")).expect("Failed to open chat store"),
        );
        let job_store = Arc::new(
            SqliteJobStore::new(db_dir.join("jobs.db")).expect("Failed to open job store"),
        );

        let user_id = user_store
            .create_user(TEST_USER)
            .expect("Failed to create test user");
        let token = user_store
            .create_auth_token(user_id)
            .expect("Failed to create test token")
            .value
            .0;
        let other_id = user_store
            .create_user(OTHER_USER)
            .expect("Failed to create other user");
        let other_token = user_store
            .create_auth_token(other_id)
            .expect("Failed to create other token")
            .value
            .0;

        let mut scheduler = FutureScheduler::new(
            job_store.clone(),
            SchedulerSettings {
                enabled: true,
                schedule_cycle: Duration::from_millis(SCHEDULE_CYCLE_MS),
                delete_after_completion: false,
                requeue_stale_on_start: true,
            },
        );
        scheduler.add_handler(
            CHAT_JOB_TYPE,
            Arc::new(SessionFinalizer::new(chat_store.clone())),
        );
        let scheduler_handle = scheduler.start();

        let engine = Arc::new(ScriptedEngine::default());
        let protocol = Arc::new(ChatProtocol::new(
            chat_store.clone(),
            user_store.clone(),
            job_store.clone(),
            engine.clone(),
            ChatSettings {
                idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
                instruction_key: "interactive_chat".to_string(),
            },
        ));

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");

        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let base_url = format!("http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let config = ServerConfig {
            port,
            metrics_port: 0,
            requests_logging_level: RequestsLoggingLevel::None,
        };
        let app = make_app(ServerState::new(config, protocol, user_store.clone()));

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            user_store,
            chat_store,
            job_store,
            engine,
            token,
            user_id,
            other_token,
            _temp_db_dir: temp_db_dir,
            _scheduler: scheduler_handle,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    /// Websocket URL of the chat endpoint
    pub fn ws_url(&self, session_id: Option<&str>) -> String {
        let base = self.base_url.replace("http://", "ws://") + "/v1/chat/ws";
        match session_id {
            Some(id) => format!("{}?session_id={}", base, id),
            None => base,
        }
    }

    /// Waits for the server to become ready by polling the / endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
        // TempDir is cleaned up automatically
    }
}
