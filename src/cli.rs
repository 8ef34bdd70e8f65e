use std::{net::IpAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use tracing::Level;

use crate::config::Config;

/// The command line interface for serial relay.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Level of logs written to stdout.
    /// `RUST_LOG` narrows it down further.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: Level,

    /// Also write debug logs to a daily rotated file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Subcommands.
    /// Without one, the relay is started.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Bridge websocket clients to the serial line.
    Start {
        /// The serial device, e.g. `/dev/ttyUSB0` or `COM1`
        #[arg(long)]
        device: Option<String>,

        /// Address to listen on
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Use an in-memory line with this name instead of a device
        #[arg(long)]
        mock: Option<String>,
    },

    /// Send a message to the device and print what it answers.
    Probe {
        /// What to send
        message: String,

        /// The serial device
        #[arg(long)]
        device: Option<String>,

        /// How long to wait for an answer
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },

    /// Print the command which sets up the line.
    SetupCommand {
        /// The serial device
        #[arg(long)]
        device: Option<String>,
    },

    /// List the serial ports the OS knows about.
    Ports,

    /// Examples for user convenience.
    #[command(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

impl Commands {
    /// Fold command line overrides into the configuration.
    pub fn apply_to(&self, config: &mut Config) {
        match self {
            Commands::Start {
                device,
                host,
                port,
                mock,
            } => {
                if let Some(device) = device {
                    config.line.port = Some(device.clone());
                }
                if let Some(host) = host {
                    config.relay.host = *host;
                }
                if let Some(port) = port {
                    config.relay.port = *port;
                }
                if mock.is_some() {
                    config.mock = mock.clone();
                }
            }
            Commands::Probe { device, .. } | Commands::SetupCommand { device } => {
                if let Some(device) = device {
                    config.line.port = Some(device.clone());
                }
            }
            Commands::Ports | Commands::Examples(_) => {}
        }
    }
}
