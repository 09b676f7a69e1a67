//! Device-to-cloud transport
//!
//! [`TransportStateMachine`] owns connection state and outgoing events,
//! [`MqttProvider`] implementations do the wire work, and [`MqttTransport`]
//! drives the state machine from a single task.

pub mod client;
pub mod connection;
pub mod provider;
pub mod rumqttc_provider;
pub mod state_machine;

pub use client::{MqttTransport, TransportSnapshot};
pub use connection::{ConnectionState, ConnectionStatus, MessageId, TopicBuilder, TransportError};
pub use provider::{MqttProvider, ProviderError, ProviderEvent, ProviderNotifier};
pub use rumqttc_provider::{ProviderOptions, RumqttcProvider};
pub use state_machine::{
    EventCallback, ImplicitConnectPolicy, Observers, PendingEvent, StatusObserver,
    TransportStateMachine,
};
