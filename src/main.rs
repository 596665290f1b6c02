use anyhow::Result;
use clap::Parser;
use sheetpilot::{CliArgs, ServerConfig, run_server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = CliArgs::parse();
    let config = ServerConfig::from_args(cli)?;
    run_server(config).await
}
