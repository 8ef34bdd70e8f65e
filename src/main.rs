use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serial_relay::{
    cli::{self, Commands},
    config::Config,
    logging,
    serial::{self, SerialMessage},
    server,
};
use tracing::{debug, info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                tracing::warn!(?e, "Cannot listen for hangups");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, quitting")
            }
            _ = hangup.recv() => {
                info!("Told to hang up, quitting")
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C, quitting")
    }
}

fn load_config(cli: &cli::Cli) -> Result<Config> {
    let mut config = if let Some(config_path) = &cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };

    if let Some(command) = &cli.command {
        command.apply_to(&mut config);
    }

    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    logging::init(
        cli.log_level,
        cli.log_dir.clone().map(|dir| (Level::DEBUG, dir)),
    )
    .await;

    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Start {
        device: None,
        host: None,
        port: None,
        mock: None,
    }) {
        Commands::Start { .. } => {
            server::run(config, shutdown_signal()).await?;
            info!("Stopped");
        }
        Commands::Probe {
            message, wait_ms, ..
        } => {
            let answer = serial::probe(
                config.line_config()?,
                message.as_bytes(),
                config.serial.settle_delay(),
                Duration::from_millis(wait_ms),
            )
            .await?;

            if answer.is_empty() {
                return Err(eyre!("No answer within {wait_ms} ms"));
            }

            println!("{}", SerialMessage::new_lossy(&answer).as_str());
        }
        Commands::SetupCommand { .. } => {
            println!("{}", config.line_config()?.build_setup_command());
        }
        Commands::Ports => {
            let ports = tokio_serial::available_ports()?;
            if ports.is_empty() {
                info!("No serial ports available");
            }

            for port in ports {
                println!("{}", port.port_name);
            }
        }
        Commands::Examples(cli::Examples::Config) => {
            println!("{}", Config::example().serialize_pretty()?);
        }
    }

    Ok(())
}
