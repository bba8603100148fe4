//! CLI subcommand definitions and handlers.
//!
//! - `serve` (default) -- start the gateway
//! - `cert` -- generate a throwaway identity and write its certificate
//! - `config show|path` -- inspect the effective configuration
//! - `version` -- print version information

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::json;

use crate::config::{self, ConfigError, GatewayConfig};
use crate::tls;

/// Loopback TLS gateway for a local wallet backend.
#[derive(Parser, Debug)]
#[command(name = "wallet-gateway", version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Config file (default: $WALLET_GATEWAY_CONFIG or config/gateway.json5).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start the gateway (default when no subcommand is given).
    #[command(alias = "start")]
    Serve {
        /// Development mode: fixed port, no token check, CORS for the dev origin.
        #[arg(long)]
        dev: bool,
    },

    /// Generate a TLS identity and write its certificate as PEM.
    Cert {
        /// Output path (default: the configured certificate path).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Print the effective configuration.
    Show,
    /// Print the config file path.
    Path,
}

impl Cli {
    /// The config file this invocation reads.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(config::get_config_path)
    }

    pub fn load_config(&self) -> Result<GatewayConfig, ConfigError> {
        config::load_config_from(&self.config_path())
    }
}

/// Run the `cert` subcommand.
pub fn handle_cert(
    output: Option<&Path>,
    config: &GatewayConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = output.unwrap_or(config.certificate_path.as_path());
    let identity = tls::generate_identity()?;
    tls::persist_certificate(&identity, path)?;

    println!("Certificate: {}", path.display());
    println!("Fingerprint: {}", identity.fingerprint());
    println!("Valid until: {}", identity.not_after.to_rfc3339());
    Ok(())
}

/// Run the `config show` subcommand.
pub fn handle_config_show(config: &GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(&config_summary(config))?);
    Ok(())
}

pub fn handle_config_path(path: &Path) {
    println!("{}", path.display());
}

pub fn handle_version() {
    println!("wallet-gateway {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform: {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

fn config_summary(config: &GatewayConfig) -> serde_json::Value {
    json!({
        "gateway": {
            "devMode": config.dev_mode,
            "devPort": config.dev_port,
            "port": config.port,
            "certificatePath": config.certificate_path.display().to_string(),
            "devOrigin": config.dev_origin,
            "downloadsDir": config.downloads_dir().map(|d| d.display().to_string()),
            "keepAliveSecs": config.keep_alive.as_secs(),
        },
        "backend": {
            "testing": config.testing,
        },
    })
}
