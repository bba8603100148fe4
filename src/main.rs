use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use wallet_gateway::backend::MemoryBackend;
use wallet_gateway::cli::{self, Cli, Command, ConfigCommand};
use wallet_gateway::logging::{self, LogConfig};
use wallet_gateway::server::handlers::SystemOpener;
use wallet_gateway::server::{start_gateway, GatewayOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.command {
        None => run_server(&cli, false).await,
        Some(Command::Serve { dev }) => run_server(&cli, *dev).await,

        Some(Command::Cert { output }) => {
            let config = cli.load_config()?;
            cli::handle_cert(output.as_deref(), &config)
        }

        Some(Command::Config(ConfigCommand::Show)) => {
            let config = cli.load_config()?;
            cli::handle_config_show(&config)
        }

        Some(Command::Config(ConfigCommand::Path)) => {
            cli::handle_config_path(&cli.config_path());
            Ok(())
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn run_server(cli: &Cli, dev_flag: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = cli.load_config()?;
    config.dev_mode |= dev_flag;

    logging::init_logging(LogConfig::for_mode(config.dev_mode))?;
    info!(
        target: "gateway",
        version = env!("CARGO_PKG_VERSION"),
        dev_mode = config.dev_mode,
        "starting wallet-gateway"
    );

    let backend = Arc::new(MemoryBackend::new(config.testing));
    let handle = start_gateway(
        GatewayOptions::from(&config),
        backend,
        Arc::new(SystemOpener),
    )
    .await?;

    // The UI reads this single line from stdout; logs go to stderr.
    println!(
        "{}",
        serde_json::to_string(&handle.descriptor().announcement())?
    );

    let reason = await_shutdown_trigger().await;
    info!(target: "gateway", "shutdown signal received ({})", reason);
    handle.shutdown().await;
    Ok(())
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                target: "gateway",
                "failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            wait_for_ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            warn!(target: "gateway", "failed to install Ctrl+C handler: {}; running until killed", e);
            std::future::pending().await
        }
    }
}
