use clap::Parser;
use loan_intake_lib::config::BridgeConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,loan_intake_lib=info")),
        )
        .init();

    let config = BridgeConfig::parse();
    if let Err(e) = loan_intake_lib::run(config).await {
        tracing::error!("[server] {e}");
        std::process::exit(1);
    }
}
