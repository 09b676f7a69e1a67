//! Pure connection state types for the device transport
//!
//! This module contains the connection state enum, the status values handed
//! to observers, message identifiers, topic construction and the transport
//! error type. Nothing here performs I/O.

use crate::auth::AuthError;
use crate::transport::provider::ProviderError;
use std::fmt;
use thiserror::Error;

/// Connection state of the device transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and no connect request outstanding
    Disconnected,
    /// Connect issued to the provider, waiting for its connected notification
    Connecting,
    /// Connected and ready to publish
    Connected,
    /// Disconnect issued to the provider, waiting for its disconnected notification
    Disconnecting,
}

impl ConnectionState {
    /// Check if the state allows publishing (pure function)
    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if a connect call toward the provider may be issued (pure function)
    pub fn can_start_connect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }

    /// Check if a disconnect call toward the provider may be issued (pure function)
    pub fn can_start_disconnect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Status value handed to the connected and disconnected observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    /// The literal status string (`"connected"` or `"disconnected"`)
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<&str> for ConnectionStatus {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Provider-issued identifier correlating a publish with its acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        MessageId(id)
    }
}

/// IoT Hub topic construction
pub struct TopicBuilder;

impl TopicBuilder {
    /// Build device-to-cloud telemetry topic: `devices/{device_id}/messages/events/`
    pub fn build_telemetry_topic(device_id: &str) -> String {
        format!("devices/{device_id}/messages/events/")
    }

    /// Build the MQTT username IoT Hub expects:
    /// `{hostname}/{device_id}/?api-version={api_version}`
    pub fn build_username(hostname: &str, device_id: &str, api_version: &str) -> String {
        format!("{hostname}/{device_id}/?api-version={api_version}")
    }
}

/// Errors surfaced to the caller of a transport operation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("Provider rejected the request: {0}")]
    Provider(#[from] ProviderError),
    #[error("Transport is disconnecting, event rejected")]
    Disconnecting,
    #[error("Transport task has stopped")]
    Closed,
    #[error("Timed out waiting for {0} state")]
    Timeout(ConnectionState),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_topic() {
        assert_eq!(
            TopicBuilder::build_telemetry_topic("MyPensieve"),
            "devices/MyPensieve/messages/events/"
        );
    }

    #[test]
    fn test_username() {
        assert_eq!(
            TopicBuilder::build_username("hub.azure-devices.net", "dev-1", "2018-06-30"),
            "hub.azure-devices.net/dev-1/?api-version=2018-06-30"
        );
    }

    #[test]
    fn test_status_literals() {
        assert_eq!(ConnectionStatus::Connected.as_str(), "connected");
        assert_eq!(ConnectionStatus::Disconnected.as_str(), "disconnected");
        assert_eq!(ConnectionStatus::Connected, "connected");
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.can_publish());
        assert!(!ConnectionState::Connecting.can_publish());
        assert!(!ConnectionState::Disconnecting.can_publish());

        assert!(ConnectionState::Disconnected.can_start_connect());
        assert!(!ConnectionState::Connecting.can_start_connect());
        assert!(!ConnectionState::Disconnecting.can_start_connect());

        assert!(ConnectionState::Connected.can_start_disconnect());
        assert!(ConnectionState::Connecting.can_start_disconnect());
        assert!(!ConnectionState::Disconnected.can_start_disconnect());
        assert!(!ConnectionState::Disconnecting.can_start_disconnect());
    }

    #[test]
    fn test_transport_error_display() {
        let errors = vec![
            TransportError::Auth(AuthError::MissingField("HostName")),
            TransportError::Provider(ProviderError::ConnectionFailed("refused".into())),
            TransportError::Disconnecting,
            TransportError::Closed,
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
