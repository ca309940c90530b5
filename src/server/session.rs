use super::state::ServerState;
use crate::user::{AuthTokenValue, UserId};

use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{request::Parts, HeaderMap, StatusCode},
    response::IntoResponse,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Session {
    pub user_id: UserId,
}

pub const COOKIE_SESSION_TOKEN_KEY: &str = "session_token";
pub const HEADER_SESSION_TOKEN_KEY: &str = "Authorization";
const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug)]
pub enum SessionExtractionError {
    AccessDenied,
    InternalError,
}

impl IntoResponse for SessionExtractionError {
    fn into_response(self) -> axum::response::Response {
        match self {
            SessionExtractionError::AccessDenied => StatusCode::FORBIDDEN.into_response(),
            SessionExtractionError::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

fn extract_session_token_from_cookies(headers: &HeaderMap) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(COOKIE_SESSION_TOKEN_KEY)
        .map(Cookie::value)
        .map(|s| s.to_string())
}

fn extract_session_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(HEADER_SESSION_TOKEN_KEY)?;
    let raw = String::from_utf8_lossy(value.as_bytes()).into_owned();
    let token = raw.strip_prefix(BEARER_PREFIX).unwrap_or(raw.as_str()).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// `Ok(None)` when the request carries no known token.
fn extract_session(
    parts: &Parts,
    ctx: &ServerState,
) -> Result<Option<Session>, SessionExtractionError> {
    let Some(token) = extract_session_token_from_cookies(&parts.headers)
        .or_else(|| extract_session_token_from_headers(&parts.headers))
    else {
        debug!("No token in cookies nor headers.");
        return Ok(None);
    };

    let auth_token_value = AuthTokenValue(token);
    let auth_token = match ctx.user_store.get_auth_token(&auth_token_value) {
        Ok(Some(token)) => token,
        Ok(None) => {
            debug!("Auth token not found in database");
            return Ok(None);
        }
        Err(e) => {
            warn!("Failed to get auth token from database: {:#}", e);
            return Err(SessionExtractionError::InternalError);
        }
    };

    if let Err(e) = ctx.user_store.touch_auth_token(&auth_token_value) {
        debug!("Failed to update auth token last_used timestamp: {}", e);
    }

    debug!("Found auth token for user_id={}", auth_token.user_id);
    Ok(Some(Session {
        user_id: auth_token.user_id,
    }))
}

impl FromRequestParts<ServerState> for Session {
    type Rejection = SessionExtractionError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        extract_session(parts, ctx)?.ok_or(SessionExtractionError::AccessDenied)
    }
}

impl OptionalFromRequestParts<ServerState> for Session {
    type Rejection = SessionExtractionError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &ServerState,
    ) -> Result<Option<Self>, Self::Rejection> {
        extract_session(parts, ctx)
    }
}
