//! IoT Hub device transport
//!
//! Device-to-cloud telemetry over MQTT for Azure IoT Hub devices
//! authenticated with a shared access key.
//!
//! # Overview
//!
//! - [`auth`]: connection string parsing and SAS token signing
//! - [`transport`]: the connection state machine, the provider abstraction,
//!   a rumqttc-backed provider and the [`MqttTransport`] handle
//! - [`config`]: TOML device configuration
//! - [`observability`]: structured logging
//!
//! # Quick Start
//!
//! ```no_run
//! use iothub_device::config::DeviceConfig;
//! use iothub_device::transport::MqttTransport;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeviceConfig::from_connection_string(
//!     "HostName=example.azure-devices.net;DeviceId=sensor-1;SharedAccessKey=c2VjcmV0",
//! );
//! let transport = MqttTransport::from_config(&config)?;
//!
//! // Connects on first send; the receiver resolves once IoT Hub acknowledges
//! let ack = transport.send_event_tracked(r#"{"temperature":21.5}"#).await?;
//! ack.await?;
//! transport.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod observability;
pub mod testing;
pub mod transport;

pub use auth::{AuthError, AuthenticationProvider, SymmetricKeyAuthenticationProvider};
pub use config::{ConfigError, DeviceConfig};
pub use transport::{
    ConnectionState, ConnectionStatus, MessageId, MqttProvider, MqttTransport, TransportError,
    TransportStateMachine,
};
