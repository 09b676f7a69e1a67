//! Transport provider abstraction
//!
//! The provider performs the actual network I/O (TLS, MQTT framing). The
//! state machine calls into it through [`MqttProvider`] and receives its
//! asynchronous notifications as [`ProviderEvent`] messages posted through a
//! [`ProviderNotifier`].

use super::connection::MessageId;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Synchronous rejections raised by a provider call
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Provider has no active connection")]
    NotConnected,
}

/// Wire-level collaborator of the transport state machine
///
/// Every method starts an asynchronous operation and returns as soon as the
/// request has been accepted. Completion is reported later through the
/// [`ProviderNotifier`] the provider was built with.
#[async_trait]
pub trait MqttProvider: Send + Sync {
    /// Start a connection attempt authenticated with `token`
    async fn connect(&self, token: &str) -> Result<(), ProviderError>;

    /// Start a publish and return the identifier its acknowledgement will carry
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<MessageId, ProviderError>;

    /// Start tearing the connection down
    async fn disconnect(&self) -> Result<(), ProviderError>;
}

/// Notifications raised by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEvent {
    Connected,
    Disconnected,
    Published(MessageId),
}

/// Cloneable handle a provider uses to deliver notifications to the transport
///
/// Notifications are queued, never delivered re-entrantly, so a provider may
/// raise them at any time, including from inside one of its own trait methods.
#[derive(Debug, Clone)]
pub struct ProviderNotifier {
    tx: mpsc::UnboundedSender<ProviderEvent>,
}

impl ProviderNotifier {
    pub fn new(tx: mpsc::UnboundedSender<ProviderEvent>) -> Self {
        Self { tx }
    }

    /// Create a notifier together with the receiving end of its queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn on_connected(&self) {
        self.notify(ProviderEvent::Connected);
    }

    pub fn on_disconnected(&self) {
        self.notify(ProviderEvent::Disconnected);
    }

    pub fn on_published(&self, message_id: MessageId) {
        self.notify(ProviderEvent::Published(message_id));
    }

    fn notify(&self, event: ProviderEvent) {
        if self.tx.send(event).is_err() {
            debug!(?event, "Transport stopped, dropping provider notification");
        }
    }
}
