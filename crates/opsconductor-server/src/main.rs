use clap::Parser;
use opsconductor_core::OpsConfig;
use tracing::warn;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries command output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opsconductor_server=info,opsconductor_scheduler=info".into()),
        )
        .init();

    let cli = cli::Cli::parse();

    // load config: --config / OPSCONDUCTOR_CONFIG > ~/.opsconductor/opsconductor.toml
    let config = OpsConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        OpsConfig::default()
    });

    commands::execute(cli.command, config).await
}
