//! not-my-board Exporter
//!
//! Runs where the hardware is attached: registers a place with the hub
//! and serves authenticated CONNECT tunnels to its TCP endpoints and USB
//! devices.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use exporter::{exporter::Exporter, usbip};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "not-my-board-exporter")]
#[command(author, version, about = "Board farm exporter - share attached hardware")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a place and serve tunnels until interrupted
    Serve {
        /// Hub URL, e.g. "http://hub.example.com:2092"
        #[arg(long, value_name = "URL")]
        hub_url: String,

        /// Bearer token for the hub control channel
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,

        /// Path to the export description TOML file
        export_description: std::path::PathBuf,
    },
    /// Device-manager hook: handle a USB add uevent
    Uevent {
        /// Kernel devpath of the device, e.g. "/devices/.../usb1/1-5"
        devpath: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level).context("failed to setup logging")?;

    match args.command {
        Command::Serve {
            hub_url,
            token,
            export_description,
        } => {
            info!("not-my-board exporter v{}", env!("CARGO_PKG_VERSION"));
            let exporter = Exporter::new(hub_url, &export_description, token)?;

            let result = tokio::select! {
                result = exporter.run() => result,
                signal = tokio::signal::ctrl_c() => {
                    signal.context("error waiting for Ctrl+C")?;
                    info!("received Ctrl+C, shutting down");
                    Ok(())
                }
            };
            exporter.shutdown().await;
            result
        }
        Command::Uevent { devpath } => usbip::handle_uevent(&devpath),
    }
}
