//! Device transport state machine
//!
//! Owns the connection state, the queue of events submitted before a
//! connection exists and the map of publishes awaiting acknowledgement.
//! Every mutation goes through `&mut self`, so whoever owns the machine
//! holds the critical section; [`crate::transport::client::MqttTransport`]
//! owns it from a single task and feeds it both application commands and
//! provider notifications.

use super::connection::{ConnectionState, ConnectionStatus, MessageId, TopicBuilder, TransportError};
use super::provider::{MqttProvider, ProviderEvent};
use crate::auth::AuthenticationProvider;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Completion callback for a single event, invoked when its acknowledgement arrives
pub type EventCallback = Box<dyn FnOnce() + Send + 'static>;

/// Observer for connected/disconnected transitions
pub type StatusObserver = Box<dyn Fn(ConnectionStatus) + Send + Sync + 'static>;

/// Whether `send_event` on a disconnected transport starts a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImplicitConnectPolicy {
    /// Sending while disconnected queues the event and starts a connection
    #[default]
    OnSend,
    /// Sending while disconnected only queues; the application must call connect
    Never,
}

impl ImplicitConnectPolicy {
    pub fn from_flag(connect_on_send: bool) -> Self {
        if connect_on_send {
            ImplicitConnectPolicy::OnSend
        } else {
            ImplicitConnectPolicy::Never
        }
    }
}

/// An event submitted while the transport was not connected
pub struct PendingEvent {
    pub payload: Bytes,
    pub callback: Option<EventCallback>,
}

impl fmt::Debug for PendingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingEvent")
            .field("payload_len", &self.payload.len())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Application hooks invoked by the state machine
#[derive(Default)]
pub struct Observers {
    pub on_connected: Option<StatusObserver>,
    pub on_disconnected: Option<StatusObserver>,
    /// Fired once per resolved acknowledgement, after the per-event callback
    pub on_event_sent: Option<Box<dyn Fn() + Send + Sync + 'static>>,
    /// Fired with the number of queued and in-flight events dropped by a disconnect
    pub on_events_abandoned: Option<Box<dyn Fn(usize) + Send + Sync + 'static>>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .field("on_event_sent", &self.on_event_sent.is_some())
            .field("on_events_abandoned", &self.on_events_abandoned.is_some())
            .finish()
    }
}

/// Connection-and-publish state machine for one device session
pub struct TransportStateMachine {
    state: ConnectionState,
    device_id: String,
    topic: String,
    auth: Arc<dyn AuthenticationProvider>,
    provider: Arc<dyn MqttProvider>,
    pending: VecDeque<PendingEvent>,
    in_flight: HashMap<MessageId, Option<EventCallback>>,
    observers: Observers,
    connect_policy: ImplicitConnectPolicy,
}

impl TransportStateMachine {
    pub fn new(auth: Arc<dyn AuthenticationProvider>, provider: Arc<dyn MqttProvider>) -> Self {
        let device_id = auth.device_id().to_string();
        let topic = TopicBuilder::build_telemetry_topic(&device_id);

        Self {
            state: ConnectionState::Disconnected,
            device_id,
            topic,
            auth,
            provider,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            observers: Observers::default(),
            connect_policy: ImplicitConnectPolicy::default(),
        }
    }

    pub fn with_connect_policy(mut self, policy: ImplicitConnectPolicy) -> Self {
        self.connect_policy = policy;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn connect_policy(&self) -> ImplicitConnectPolicy {
        self.connect_policy
    }

    /// Number of events waiting for a connection
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of publishes waiting for acknowledgement
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn set_on_connected(&mut self, observer: impl Fn(ConnectionStatus) + Send + Sync + 'static) {
        self.observers.on_connected = Some(Box::new(observer));
    }

    pub fn set_on_disconnected(
        &mut self,
        observer: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) {
        self.observers.on_disconnected = Some(Box::new(observer));
    }

    pub fn set_on_event_sent(&mut self, observer: impl Fn() + Send + Sync + 'static) {
        self.observers.on_event_sent = Some(Box::new(observer));
    }

    pub fn set_on_events_abandoned(&mut self, observer: impl Fn(usize) + Send + Sync + 'static) {
        self.observers.on_events_abandoned = Some(Box::new(observer));
    }

    /// Replace all observers at once
    pub fn set_observers(&mut self, observers: Observers) {
        self.observers = observers;
    }

    /// Start a connection if none exists or is in progress
    ///
    /// A fresh token is fetched from the authentication provider for every
    /// connect call actually issued. Auth or provider failures leave the state
    /// untouched and are returned to the caller.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if !self.state.can_start_connect() {
            debug!(state = %self.state, "Connect ignored");
            return Ok(());
        }

        let token = self.auth.get_current_sas_token()?;
        self.provider.connect(&token).await?;
        self.transition_to(ConnectionState::Connecting);
        Ok(())
    }

    /// Publish an event now if connected, otherwise queue it for the next connection
    pub async fn send_event(
        &mut self,
        payload: impl Into<Bytes>,
        callback: Option<EventCallback>,
    ) -> Result<(), TransportError> {
        let payload = payload.into();

        match self.state {
            ConnectionState::Connected if !self.pending.is_empty() => {
                // Earlier events are still queued after a rejected drain
                self.enqueue(payload, callback);
                self.drain_pending().await
            }
            ConnectionState::Connected => {
                let message_id = self.provider.publish(&self.topic, payload).await?;
                self.track(message_id, callback);
                Ok(())
            }
            ConnectionState::Disconnected => {
                if self.connect_policy == ImplicitConnectPolicy::OnSend {
                    self.connect().await?;
                }
                self.enqueue(payload, callback);
                Ok(())
            }
            ConnectionState::Connecting => {
                self.enqueue(payload, callback);
                Ok(())
            }
            ConnectionState::Disconnecting => {
                warn!(topic = %self.topic, "Event rejected while disconnecting");
                Err(TransportError::Disconnecting)
            }
        }
    }

    /// Start tearing down the connection if one exists or is being established
    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.state.can_start_disconnect() {
            debug!(state = %self.state, "Disconnect ignored");
            return Ok(());
        }

        self.provider.disconnect().await?;
        self.transition_to(ConnectionState::Disconnecting);
        Ok(())
    }

    /// Dispatch a provider notification
    pub async fn handle_provider_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::Connected => self.on_connected().await,
            ProviderEvent::Disconnected => self.on_disconnected(),
            ProviderEvent::Published(message_id) => self.on_published(message_id),
        }
    }

    /// Provider reports the connection is established
    pub async fn on_connected(&mut self) {
        if self.state != ConnectionState::Connecting {
            warn!(state = %self.state, "Unexpected connected notification ignored");
            return;
        }

        self.transition_to(ConnectionState::Connected);
        if let Some(observer) = &self.observers.on_connected {
            observer(ConnectionStatus::Connected);
        }
        if self.drain_pending().await.is_err() {
            debug!(queued = self.pending.len(), "Queued events wait for the next send");
        }
    }

    /// Provider reports the connection is gone
    ///
    /// Queued and unacknowledged events are dropped without invoking their
    /// callbacks.
    pub fn on_disconnected(&mut self) {
        if self.state == ConnectionState::Disconnected {
            warn!("Unexpected disconnected notification ignored");
            return;
        }

        self.transition_to(ConnectionState::Disconnected);

        let abandoned_pending = self.pending.len();
        let abandoned_in_flight = self.in_flight.len();
        self.pending.clear();
        self.in_flight.clear();

        let abandoned = abandoned_pending + abandoned_in_flight;
        if abandoned > 0 {
            warn!(
                pending = abandoned_pending,
                in_flight = abandoned_in_flight,
                "Events abandoned on disconnect"
            );
            if let Some(observer) = &self.observers.on_events_abandoned {
                observer(abandoned);
            }
        }

        if let Some(observer) = &self.observers.on_disconnected {
            observer(ConnectionStatus::Disconnected);
        }
    }

    /// Provider reports the publish identified by `message_id` was acknowledged
    pub fn on_published(&mut self, message_id: MessageId) {
        let Some(callback) = self.in_flight.remove(&message_id) else {
            warn!(%message_id, "Acknowledgement for untracked message ignored");
            return;
        };

        debug!(%message_id, remaining = self.in_flight.len(), "Event acknowledged");
        if let Some(callback) = callback {
            callback();
        }
        if let Some(observer) = &self.observers.on_event_sent {
            observer();
        }
    }

    fn enqueue(&mut self, payload: Bytes, callback: Option<EventCallback>) {
        self.pending.push_back(PendingEvent { payload, callback });
        debug!(
            state = %self.state,
            queued = self.pending.len(),
            "Event queued until connected"
        );
    }

    fn track(&mut self, message_id: MessageId, callback: Option<EventCallback>) {
        if self.in_flight.insert(message_id, callback).is_some() {
            warn!(%message_id, "Provider reused an in-flight message id, previous callback dropped");
        }
        debug!(%message_id, in_flight = self.in_flight.len(), "Event published");
    }

    /// Publish queued events in arrival order
    ///
    /// Stops at the first rejected publish, leaving that event and the ones
    /// behind it queued, and returns the rejection.
    async fn drain_pending(&mut self) -> Result<(), TransportError> {
        while self.state.can_publish() {
            let Some(event) = self.pending.pop_front() else {
                break;
            };

            match self.provider.publish(&self.topic, event.payload.clone()).await {
                Ok(message_id) => self.track(message_id, event.callback),
                Err(e) => {
                    error!(
                        error = %e,
                        queued = self.pending.len() + 1,
                        "Publishing queued event failed, keeping remaining events queued"
                    );
                    self.pending.push_front(event);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn transition_to(&mut self, next: ConnectionState) {
        info!(
            device_id = %self.device_id,
            from = %self.state,
            to = %next,
            "Transport state transition"
        );
        self.state = next;
    }
}

impl fmt::Debug for TransportStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportStateMachine")
            .field("state", &self.state)
            .field("topic", &self.topic)
            .field("pending", &self.pending.len())
            .field("in_flight", &self.in_flight.len())
            .field("observers", &self.observers)
            .field("connect_policy", &self.connect_policy)
            .finish()
    }
}
