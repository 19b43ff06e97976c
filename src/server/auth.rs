use super::AppState;
use crate::config::BridgeConfig;
use crate::error::AppError;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// How callers of `/workflow` and `/upload` are authenticated.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthMode {
    /// The surrounding deployment already authenticated the session.
    None,
    Token(String),
}

impl AuthMode {
    pub fn from_config(config: &BridgeConfig) -> Self {
        match config.session_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => AuthMode::Token(token.to_string()),
            _ => AuthMode::None,
        }
    }
}

pub fn validate_auth(mode: &AuthMode, authorization_header: Option<&str>) -> Result<(), AppError> {
    match mode {
        AuthMode::None => Ok(()),
        AuthMode::Token(expected) => {
            let header = authorization_header
                .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".into()))?;
            let token = header.strip_prefix("Bearer ").unwrap_or(header);
            if constant_time_eq(token.as_bytes(), expected.as_bytes()) {
                Ok(())
            } else {
                Err(AppError::Unauthorized("Invalid session token".into()))
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub async fn require_session(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let header = request.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if let Err(err) = validate_auth(&state.auth, header) {
        tracing::warn!(path = %request.uri().path(), "[auth] {err}");
        return err.into_response();
    }
    next.run(request).await
}
