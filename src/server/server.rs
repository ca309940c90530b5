use anyhow::{Context, Result};
use std::{future::Future, sync::Arc, time::Duration};

use tracing::{error, info, warn};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use super::{log_requests, metrics, state::*, websocket::chat_ws_handler, ServerConfig};
use crate::chat::{ArchiveOutcome, ChatProtocol, ChatSession};
use crate::future_jobs::JobStatus;
use crate::server::session::Session;
use crate::user::UserStore;

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub hash: String,
    pub connections: usize,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        hash: state.hash.clone(),
        connections: state.connections.count().await,
    };
    Json(stats)
}

fn archived_response(session: ChatSession) -> Response {
    Json(session).into_response()
}

async fn archive_chat(
    session: Session,
    State(protocol): State<GuardedChatProtocol>,
    Path(session_id): Path<String>,
) -> Response {
    let outcome = match protocol.chats().archive(session.user_id, &session_id) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Failed to archive chat {}: {:#}", session_id, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match outcome {
        ArchiveOutcome::Missing => StatusCode::NOT_FOUND.into_response(),
        ArchiveOutcome::AlreadyArchived(chat) => archived_response(chat),
        ArchiveOutcome::Archived(chat) => {
            info!("User {} archived chat {}", session.user_id, session_id);
            cancel_idle_job(&protocol, &session_id);
            archived_response(chat)
        }
    }
}

/// The idle timer of an archived chat has nothing left to finish.
fn cancel_idle_job(protocol: &ChatProtocol, session_id: &str) {
    match protocol.jobs().find_by(session_id) {
        Ok(Some(job)) if job.status == JobStatus::Pending => {
            if let Err(e) = protocol.jobs().cancel(job.id) {
                warn!("Failed to cancel idle job {} of {}: {:#}", job.id, session_id, e);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to look up idle job of {}: {:#}", session_id, e),
    }
}

pub fn make_app(state: ServerState) -> Router {
    let chat_routes: Router = Router::new()
        .route("/chat/ws", get(chat_ws_handler))
        .route("/chats/{session_id}/archive", post(archive_chat))
        .with_state(state.clone());

    let mut app: Router = Router::new()
        .route("/", get(home))
        .with_state(state.clone())
        .nest("/v1", chat_routes);

    app = app.layer(middleware::from_fn_with_state(state.clone(), log_requests));
    app
}

fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics::metrics_handler))
}

pub async fn run_server<F>(
    config: ServerConfig,
    protocol: Arc<ChatProtocol>,
    user_store: Arc<dyn UserStore>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let port = config.port;
    let metrics_port = config.metrics_port;
    let app = make_app(ServerState::new(config, protocol, user_store));

    let metrics_listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", metrics_port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", metrics_port))?;
    info!("Serving metrics on port {}", metrics_port);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, make_metrics_app()).await {
            error!("Metrics server stopped: {}", e);
        }
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
