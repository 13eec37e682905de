//! diag-bridged - DIAG bridge daemon
//!
//! Negotiates the DIAG character device into memory-buffered logging
//! mode, then serves its traffic to TCP clients.
//!
//! Usage:
//!   diag-bridged [config.toml]
//!
//! If no config file is provided, defaults are used: /dev/diag on the
//! device side, 0.0.0.0:43555 on the TCP side.

use diag_bridge::{create_transport, negotiate, Bridge, BridgeConfig, DeviceChannel, NoFallback};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parsed command-line arguments
struct Args {
    /// Bridge config file (TOML)
    config_path: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut result = Args { config_path: None };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                // Positional argument = config file
                result.config_path = Some(arg.to_string());
                i += 1;
            }
            _ => {
                tracing::warn!("Unknown argument: {}", args[i]);
                i += 1;
            }
        }
    }

    result
}

fn print_help() {
    eprintln!(
        r#"diag-bridged - DIAG bridge daemon

Usage: diag-bridged [OPTIONS] [config.toml]

Options:
  -h, --help  Print this help message

Examples:
  # Run against /dev/diag with defaults
  diag-bridged

  # Run with config file
  diag-bridged bridge.toml
"#
    );
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "diag_bridged=info,diag_bridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting diag-bridged");

    let args = parse_args();

    let config = match &args.config_path {
        Some(path) => {
            tracing::info!(path, "Loading config");
            BridgeConfig::load(path)?
        }
        None => {
            tracing::info!("No config file provided, using defaults");
            BridgeConfig::default()
        }
    };

    let transport = create_transport(&config.transport)?;

    let outcome = negotiate(transport.as_ref(), &NoFallback, config.buffering.clone())?;
    tracing::info!(
        remote_variant = outcome.remote_variant,
        path = ?outcome.path,
        "Device negotiated"
    );

    let device = DeviceChannel::new(transport, outcome.remote_variant);
    let bridge = Bridge::bind(&config, device)?;
    tracing::info!(addr = %bridge.local_addr()?, "Listening for clients");

    bridge.run()?;
    Ok(())
}
