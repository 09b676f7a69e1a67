//! Async handle driving the transport state machine from a single task
//!
//! Application commands and provider notifications are both delivered as
//! messages to one spawned task that owns the [`TransportStateMachine`], so
//! every state mutation happens in one place and a provider may raise
//! notifications from any thread, including from inside a call the task made.

use super::connection::{ConnectionState, ConnectionStatus, TransportError};
use super::provider::{ProviderEvent, ProviderNotifier};
use super::rumqttc_provider::{ProviderOptions, RumqttcProvider};
use super::state_machine::{EventCallback, ImplicitConnectPolicy, TransportStateMachine};
use crate::auth::AuthenticationProvider;
use crate::config::{ConfigError, DeviceConfig};
use crate::transport_span;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

type Reply<T> = oneshot::Sender<T>;
type Configure = Box<dyn FnOnce(&mut TransportStateMachine) + Send + 'static>;

enum Command {
    Connect(Reply<Result<(), TransportError>>),
    SendEvent {
        payload: Bytes,
        callback: Option<EventCallback>,
        reply: Reply<Result<(), TransportError>>,
    },
    Disconnect(Reply<Result<(), TransportError>>),
    Configure(Configure),
    Snapshot(Reply<TransportSnapshot>),
}

/// Point-in-time view of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub state: ConnectionState,
    pub pending: usize,
    pub in_flight: usize,
}

impl TransportSnapshot {
    fn of(machine: &TransportStateMachine) -> Self {
        Self {
            state: machine.state(),
            pending: machine.pending_count(),
            in_flight: machine.in_flight_count(),
        }
    }
}

/// Device transport handle
///
/// Operations return once the transport has acted on them (issued the
/// provider call, queued the event, or ignored a redundant request).
/// Completion is observed through the registered observers and callbacks.
pub struct MqttTransport {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    device_id: String,
    topic: String,
    task: JoinHandle<()>,
}

impl MqttTransport {
    /// Spawn the task owning `machine`, fed by `notifications` from its provider
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        machine: TransportStateMachine,
        notifications: mpsc::UnboundedReceiver<ProviderEvent>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(machine.state());
        let device_id = machine.device_id().to_string();
        let topic = machine.topic().to_string();

        let span = transport_span!(device_id = %device_id);
        let task = tokio::spawn(
            Self::run(machine, command_rx, notifications, state_tx).instrument(span),
        );

        Self {
            commands,
            state_rx,
            device_id,
            topic,
            task,
        }
    }

    /// Build the rumqttc-backed transport described by `config`
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        let auth = Arc::new(config.authentication_provider()?);
        let options = ProviderOptions::from_config(config, auth.as_ref());
        Ok(Self::with_rumqttc(auth, options, config.connect_policy()))
    }

    /// Build a transport over [`RumqttcProvider`]
    pub fn with_rumqttc(
        auth: Arc<dyn AuthenticationProvider>,
        options: ProviderOptions,
        policy: ImplicitConnectPolicy,
    ) -> Self {
        let (notifier, notifications) = ProviderNotifier::channel();
        let provider = Arc::new(RumqttcProvider::new(options, notifier));
        let machine = TransportStateMachine::new(auth, provider).with_connect_policy(policy);
        Self::spawn(machine, notifications)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Telemetry topic every event is published to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current connection state as last published by the transport task
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver following every state change, for supervising layers
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        self.request(Command::Connect).await?
    }

    pub async fn send_event(
        &self,
        payload: impl Into<Bytes>,
        callback: Option<EventCallback>,
    ) -> Result<(), TransportError> {
        let payload = payload.into();
        self.request(|reply| Command::SendEvent {
            payload,
            callback,
            reply,
        })
        .await?
    }

    /// Send an event and get a receiver that resolves when it is acknowledged
    ///
    /// If the event is abandoned by a disconnect the receiver yields
    /// `Err(RecvError)` instead.
    pub async fn send_event_tracked(
        &self,
        payload: impl Into<Bytes>,
    ) -> Result<oneshot::Receiver<()>, TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let callback: EventCallback = Box::new(move || {
            let _ = ack_tx.send(());
        });
        self.send_event(payload, Some(callback)).await?;
        Ok(ack_rx)
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.request(Command::Disconnect).await?
    }

    pub async fn set_on_connected(
        &self,
        observer: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> Result<(), TransportError> {
        self.configure(move |machine| machine.set_on_connected(observer))
            .await
    }

    pub async fn set_on_disconnected(
        &self,
        observer: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> Result<(), TransportError> {
        self.configure(move |machine| machine.set_on_disconnected(observer))
            .await
    }

    pub async fn set_on_event_sent(
        &self,
        observer: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), TransportError> {
        self.configure(move |machine| machine.set_on_event_sent(observer))
            .await
    }

    pub async fn set_on_events_abandoned(
        &self,
        observer: impl Fn(usize) + Send + Sync + 'static,
    ) -> Result<(), TransportError> {
        self.configure(move |machine| machine.set_on_events_abandoned(observer))
            .await
    }

    /// Current state and queue depths
    ///
    /// Notifications raised before this call are processed before the
    /// snapshot is taken.
    pub async fn snapshot(&self) -> Result<TransportSnapshot, TransportError> {
        self.request(Command::Snapshot).await
    }

    /// Wait until the transport reaches `target`, bounded by `timeout`
    pub async fn wait_for_state(
        &self,
        target: ConnectionState,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut state_rx = self.state_rx.clone();
        let wait = async {
            loop {
                if *state_rx.borrow_and_update() == target {
                    return Ok(());
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::Closed);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TransportError::Timeout(target))?
    }

    /// Stop the transport task after it has drained already-submitted commands
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        // Closing the command channel ends the task loop
        drop(commands);
        if let Err(e) = task.await {
            debug!("Transport task ended abnormally: {}", e);
        }
    }

    async fn configure(
        &self,
        configure: impl FnOnce(&mut TransportStateMachine) + Send + 'static,
    ) -> Result<(), TransportError> {
        self.commands
            .send(Command::Configure(Box::new(configure)))
            .map_err(|_| TransportError::Closed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)
    }

    async fn run(
        mut machine: TransportStateMachine,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut notifications: mpsc::UnboundedReceiver<ProviderEvent>,
        state_tx: watch::Sender<ConnectionState>,
    ) {
        info!(topic = %machine.topic(), "Device transport started");

        loop {
            tokio::select! {
                // Notifications first, so a command observes every notification
                // raised before it was sent
                biased;

                Some(event) = notifications.recv() => {
                    debug!(?event, "Provider notification");
                    machine.handle_provider_event(event).await;
                }
                command = commands.recv() => match command {
                    Some(command) => Self::handle_command(&mut machine, command).await,
                    None => break,
                },
            }

            let state = machine.state();
            state_tx.send_if_modified(|current| {
                let changed = *current != state;
                *current = state;
                changed
            });
        }

        info!(state = %machine.state(), "Device transport stopped");
    }

    async fn handle_command(machine: &mut TransportStateMachine, command: Command) {
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(machine.connect().await);
            }
            Command::SendEvent {
                payload,
                callback,
                reply,
            } => {
                let _ = reply.send(machine.send_event(payload, callback).await);
            }
            Command::Disconnect(reply) => {
                let _ = reply.send(machine.disconnect().await);
            }
            Command::Configure(configure) => configure(machine),
            Command::Snapshot(reply) => {
                let _ = reply.send(TransportSnapshot::of(machine));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAuthProvider, MockProvider};

    fn spawn_with(provider: Arc<MockProvider>, rx: mpsc::UnboundedReceiver<ProviderEvent>) -> MqttTransport {
        let auth = Arc::new(MockAuthProvider::new("MyPensieve"));
        MqttTransport::spawn(TransportStateMachine::new(auth, provider), rx)
    }

    #[tokio::test]
    async fn test_handle_exposes_topic_and_initial_state() {
        let (_notifier, rx) = ProviderNotifier::channel();
        let transport = spawn_with(Arc::new(MockProvider::new()), rx);

        assert_eq!(transport.device_id(), "MyPensieve");
        assert_eq!(transport.topic(), "devices/MyPensieve/messages/events/");
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_snapshot_observes_prior_notifications() {
        let (notifier, rx) = ProviderNotifier::channel();
        let provider = Arc::new(MockProvider::with_notifier(notifier.clone()));
        let transport = spawn_with(provider.clone(), rx);

        transport.connect().await.unwrap();
        notifier.on_connected();

        let snapshot = transport.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.in_flight, 0);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_wait_for_state_success() {
        let (notifier, rx) = ProviderNotifier::channel();
        let transport = spawn_with(Arc::new(MockProvider::responsive(notifier)), rx);

        transport.connect().await.unwrap();

        let result = transport
            .wait_for_state(ConnectionState::Connected, Duration::from_millis(500))
            .await;
        assert!(result.is_ok(), "Should observe connected state");
    }

    #[tokio::test]
    async fn test_wait_for_state_timeout() {
        let (_notifier, rx) = ProviderNotifier::channel();
        let transport = spawn_with(Arc::new(MockProvider::new()), rx);

        transport.connect().await.unwrap();

        let result = transport
            .wait_for_state(ConnectionState::Connected, Duration::from_millis(20))
            .await;
        assert!(matches!(
            result,
            Err(TransportError::Timeout(ConnectionState::Connected))
        ));
        assert_eq!(transport.connection_state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_shutdown_closes_state_channel() {
        let (_notifier, rx) = ProviderNotifier::channel();
        let transport = spawn_with(Arc::new(MockProvider::new()), rx);
        let state = transport.state();

        transport.shutdown().await;

        // The task dropped its state sender on exit
        assert!(state.has_changed().is_err());
    }

    #[tokio::test]
    async fn test_send_event_tracked_resolves_on_ack() {
        let (notifier, rx) = ProviderNotifier::channel();
        let transport = spawn_with(Arc::new(MockProvider::responsive(notifier)), rx);

        let ack = transport.send_event_tracked("payload").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), ack)
            .await
            .expect("ack should arrive")
            .expect("callback should fire, not be dropped");
    }
}
