use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokens {
    pub access_token: String,
    pub id_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub sub: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Observable snapshot of the signed-in session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub logged_in: bool,
    pub initializing: bool,
    pub user: Option<UserProfile>,
    pub tokens: Option<SessionTokens>,
    pub last_error: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            logged_in: false,
            initializing: true,
            user: None,
            tokens: None,
            last_error: None,
        }
    }
}

/// Hosted identity provider as seen by the client. Token exchange and renewal
/// scheduling live behind the implementation.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn login(&self) -> AppResult<()>;
    async fn logout(&self) -> AppResult<()>;
    async fn refresh_session(&self) -> AppResult<()>;
    fn access_token(&self) -> Option<String>;
    fn session(&self) -> watch::Receiver<SessionState>;
}

/// Provider backed by a fixed token pair. Used for service accounts and tests.
pub struct StaticTokenProvider {
    tokens: SessionTokens,
    user: UserProfile,
    state: watch::Sender<SessionState>,
}

impl StaticTokenProvider {
    pub fn new(access_token: &str, user: UserProfile) -> Self {
        let (state, _) = watch::channel(SessionState { initializing: false, ..SessionState::default() });
        Self {
            tokens: SessionTokens {
                access_token: access_token.to_string(),
                id_token: String::new(),
                refresh_token: String::new(),
            },
            user,
            state,
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    async fn login(&self) -> AppResult<()> {
        if self.tokens.access_token.is_empty() {
            let err = AppError::Unauthorized("No access token configured".into());
            self.state.send_modify(|s| s.last_error = Some(err.to_string()));
            return Err(err);
        }
        self.state.send_replace(SessionState {
            logged_in: true,
            initializing: false,
            user: Some(self.user.clone()),
            tokens: Some(self.tokens.clone()),
            last_error: None,
        });
        tracing::info!(user = ?self.user.email, "[identity] logged in");
        Ok(())
    }

    async fn logout(&self) -> AppResult<()> {
        self.state.send_replace(SessionState { initializing: false, ..SessionState::default() });
        Ok(())
    }

    async fn refresh_session(&self) -> AppResult<()> {
        if self.state.borrow().logged_in {
            Ok(())
        } else {
            Err(AppError::Unauthorized("Not logged in".into()))
        }
    }

    fn access_token(&self) -> Option<String> {
        self.state
            .borrow()
            .tokens
            .as_ref()
            .map(|t| t.access_token.clone())
    }

    fn session(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}
