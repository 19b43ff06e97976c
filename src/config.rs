use crate::error::{AppError, AppResult};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.dify.ai/v1";
pub const DEFAULT_SERVICE_USER: &str = "loan-system-user";
pub const DEFAULT_UPLOAD_MAX_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 30;

/// Runtime configuration for the bridge server.
#[derive(Debug, Clone, Parser)]
#[command(name = "loan-intake-bridge")]
#[command(version)]
#[command(about = "Loan application intake bridge for Dify workflows")]
pub struct BridgeConfig {
    #[arg(long, env = "BRIDGE_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    #[arg(long, env = "DIFY_API_KEY", hide_env_values = true)]
    pub dify_api_key: Option<String>,

    #[arg(long, env = "DIFY_API_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub dify_api_base_url: String,

    /// User identifier attached to every provider call.
    #[arg(long, env = "DIFY_SERVICE_USER", default_value = DEFAULT_SERVICE_USER)]
    pub service_user: String,

    #[arg(long, env = "UPLOAD_MAX_BYTES", default_value_t = DEFAULT_UPLOAD_MAX_BYTES)]
    pub upload_max_bytes: u64,

    #[arg(long, env = "UPLOAD_TIMEOUT_SECS", default_value_t = DEFAULT_UPLOAD_TIMEOUT_SECS)]
    pub upload_timeout_secs: u64,

    /// When set, `/workflow` and `/upload` require `Authorization: Bearer <token>`.
    #[arg(long, env = "BRIDGE_SESSION_TOKEN", hide_env_values = true)]
    pub session_token: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            dify_api_key: None,
            dify_api_base_url: DEFAULT_BASE_URL.to_string(),
            service_user: DEFAULT_SERVICE_USER.to_string(),
            upload_max_bytes: DEFAULT_UPLOAD_MAX_BYTES,
            upload_timeout_secs: DEFAULT_UPLOAD_TIMEOUT_SECS,
            session_token: None,
        }
    }
}

/// Validated provider credentials.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub base_url: String,
}

impl BridgeConfig {
    /// Credentials are checked per request so the server can start without them.
    pub fn provider_credentials(&self) -> AppResult<ProviderCredentials> {
        let api_key = self
            .dify_api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::Configuration("DIFY_API_KEY is not set".into()))?;

        let base_url = self.dify_api_base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(AppError::Configuration("DIFY_API_BASE_URL is not set".into()));
        }
        url::Url::parse(base_url)
            .map_err(|e| AppError::Configuration(format!("Invalid DIFY_API_BASE_URL '{base_url}': {e}")))?;

        Ok(ProviderCredentials {
            api_key: api_key.to_string(),
            base_url: base_url.to_string(),
        })
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}
