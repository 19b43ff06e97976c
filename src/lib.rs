// ============================================
// LOAN INTAKE BRIDGE
// Dify workflow gateway and client orchestration
// ============================================

pub mod bridge;
pub mod client;
pub mod config;
pub mod dify;
pub mod error;
pub mod form;
pub mod server;
pub mod stream;
pub mod upload;

#[cfg(test)]
mod test_support;

use config::BridgeConfig;
use error::AppResult;
use server::{start_server, AppState};

/// Run the bridge until Ctrl-C.
pub async fn run(config: BridgeConfig) -> AppResult<()> {
    if config.provider_credentials().is_err() {
        tracing::warn!("[server] provider credentials missing; /workflow and /upload will fail until configured");
    }
    let bind = config.bind;
    let state = AppState::new(config)?;
    let server = start_server(state, bind).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("[server] failed to listen for shutdown signal: {e}");
    }
    server.shutdown().await;
    Ok(())
}
