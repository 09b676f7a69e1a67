//! iothub-send: publish device-to-cloud messages from the command line

use clap::{Parser, Subcommand};
use iothub_device::config::DeviceConfig;
use iothub_device::observability::init_default_logging;
use iothub_device::transport::{ConnectionState, MqttTransport};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["device.toml", "config/device.toml"];
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Send telemetry to Azure IoT Hub as a device
#[derive(Parser)]
#[command(name = "iothub-send")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Device connection string, overriding the configured one
    #[arg(long, env = "IOTHUB_DEVICE_CONNECTION_STRING", hide_env_values = true)]
    connection_string: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish each message and wait for IoT Hub to acknowledge it
    Send {
        /// Message payloads, sent in order
        #[arg(required = true)]
        messages: Vec<String>,

        /// Seconds to wait for all acknowledgements
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Validate the configuration
    Config {
        /// Print the resolved configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(cli.config.as_ref(), cli.connection_string) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Send {
            messages,
            timeout_secs,
        } => send_messages(&config, messages, Duration::from_secs(timeout_secs)).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: Option<&PathBuf>,
    connection_string: Option<String>,
) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    let path = config_path.cloned().or_else(|| {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    });

    let config = match (path, connection_string) {
        (Some(path), connection_string) => {
            info!("Loading configuration from: {}", path.display());
            let mut config = DeviceConfig::load_from_file(&path)?;
            if let Some(connection_string) = connection_string {
                config.override_connection_string(connection_string);
            }
            config
        }
        (None, Some(connection_string)) => DeviceConfig::from_connection_string(connection_string),
        (None, None) => {
            return Err(
                "no configuration found; pass --config, --connection-string or create device.toml"
                    .into(),
            )
        }
    };

    config.validate()?;
    // Fail early on a malformed connection string or missing env var
    config.authentication_provider()?;
    Ok(config)
}

async fn send_messages(
    config: &DeviceConfig,
    messages: Vec<String>,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = MqttTransport::from_config(config)?;
    transport
        .set_on_connected(|status| info!(%status, "Device connected"))
        .await?;
    transport
        .set_on_disconnected(|status| info!(%status, "Device disconnected"))
        .await?;
    transport
        .set_on_events_abandoned(|count| warn!(count, "Unacknowledged messages abandoned"))
        .await?;

    let mut acks = Vec::with_capacity(messages.len());
    for message in messages {
        acks.push(transport.send_event_tracked(message).await?);
    }
    let total = acks.len();

    let outcome: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        result = tokio::time::timeout(timeout, wait_for_acks(acks)) => match result {
            Ok(acked) if acked == total => {
                info!(total, "All messages acknowledged");
                Ok(())
            }
            Ok(acked) => Err(format!("only {acked} of {total} messages were acknowledged").into()),
            Err(_) => Err(format!(
                "timed out after {}s waiting for acknowledgements",
                timeout.as_secs()
            )
            .into()),
        },
        _ = signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
            Ok(())
        }
    };

    if let Err(e) = transport.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    if let Err(e) = transport
        .wait_for_state(ConnectionState::Disconnected, DISCONNECT_TIMEOUT)
        .await
    {
        warn!("{}", e);
    }
    transport.shutdown().await;

    outcome
}

/// Count acknowledgements until every receiver resolves or is dropped
async fn wait_for_acks(acks: Vec<oneshot::Receiver<()>>) -> usize {
    let mut acked = 0;
    for ack in acks {
        if ack.await.is_ok() {
            acked += 1;
        }
    }
    acked
}

fn handle_config_command(
    config: &DeviceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", config.to_redacted_toml()?);
    }

    info!("Configuration validation complete");
    Ok(())
}
