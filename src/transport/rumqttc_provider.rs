//! MQTT 3.1.1 provider built on rumqttc
//!
//! Each connection attempt gets its own `AsyncClient`/`EventLoop` pair and a
//! poll task that turns broker traffic into [`ProviderEvent`] notifications.
//! The poll task never reconnects: once the session ends it reports a single
//! disconnect and exits.
//!
//! [`ProviderEvent`]: super::provider::ProviderEvent

use super::connection::{MessageId, TopicBuilder};
use super::provider::{MqttProvider, ProviderError, ProviderNotifier};
use crate::auth::SymmetricKeyAuthenticationProvider;
use crate::config::DeviceConfig;
use crate::provider_span;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

pub const DEFAULT_PORT: u16 = 8883;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;
pub const DEFAULT_API_VERSION: &str = "2018-06-30";

/// IoT Hub rejects device-to-cloud messages above 256 KiB
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Connection parameters for [`RumqttcProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOptions {
    pub hostname: String,
    pub device_id: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub use_tls: bool,
    pub channel_capacity: usize,
    pub api_version: String,
}

impl ProviderOptions {
    pub fn new(hostname: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            port: DEFAULT_PORT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            use_tls: true,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    pub fn from_config(config: &DeviceConfig, auth: &SymmetricKeyAuthenticationProvider) -> Self {
        let connection_string = auth.connection_string();
        Self {
            hostname: connection_string.connect_hostname().to_string(),
            device_id: connection_string.device_id.clone(),
            port: config.mqtt.port,
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
            use_tls: config.mqtt.use_tls,
            channel_capacity: config.mqtt.channel_capacity,
            api_version: config.mqtt.api_version.clone(),
        }
    }

    /// MQTT user name IoT Hub expects from a device
    pub fn username(&self) -> String {
        TopicBuilder::build_username(&self.hostname, &self.device_id, &self.api_version)
    }

    /// rumqttc options for one connection attempt authenticated with `token`
    pub fn mqtt_options(&self, token: &str) -> MqttOptions {
        let mut options = MqttOptions::new(self.device_id.clone(), self.hostname.clone(), self.port);
        options.set_credentials(self.username(), token);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(false);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        if self.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

/// Correlates locally issued message ids with MQTT packet ids
///
/// rumqttc assigns the packet id when the publish leaves the event loop, in
/// request order, so local ids are queued on request and bound to the next
/// outgoing publish.
#[derive(Debug, Default)]
struct PacketIds {
    awaiting_pkid: VecDeque<MessageId>,
    by_pkid: HashMap<u16, MessageId>,
}

impl PacketIds {
    fn outgoing(&mut self, pkid: u16) {
        match self.awaiting_pkid.pop_front() {
            Some(message_id) => {
                self.by_pkid.insert(pkid, message_id);
            }
            None => warn!(pkid, "Outgoing publish with no pending request"),
        }
    }

    fn acknowledged(&mut self, pkid: u16) -> Option<MessageId> {
        self.by_pkid.remove(&pkid)
    }

    fn forget(&mut self, message_id: MessageId) {
        self.awaiting_pkid.retain(|id| *id != message_id);
    }
}

type SharedPacketIds = Arc<Mutex<PacketIds>>;

fn lock(ids: &SharedPacketIds) -> MutexGuard<'_, PacketIds> {
    ids.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Session {
    client: AsyncClient,
    packet_ids: SharedPacketIds,
    poll_task: JoinHandle<()>,
}

/// [`MqttProvider`] speaking MQTT over TLS to an IoT Hub
pub struct RumqttcProvider {
    options: ProviderOptions,
    notifier: ProviderNotifier,
    session: tokio::sync::Mutex<Option<Session>>,
    next_message_id: AtomicU64,
}

impl RumqttcProvider {
    pub fn new(options: ProviderOptions, notifier: ProviderNotifier) -> Self {
        Self {
            options,
            notifier,
            session: tokio::sync::Mutex::new(None),
            next_message_id: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &ProviderOptions {
        &self.options
    }

    async fn poll(mut event_loop: EventLoop, packet_ids: SharedPacketIds, notifier: ProviderNotifier) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("Connection acknowledged");
                        notifier.on_connected();
                    } else {
                        error!(code = ?ack.code, "Connection refused");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    match lock(&packet_ids).acknowledged(ack.pkid) {
                        Some(message_id) => notifier.on_published(message_id),
                        None => debug!(pkid = ack.pkid, "PubAck for unknown packet"),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Disconnected by broker");
                    break;
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => lock(&packet_ids).outgoing(pkid),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Disconnect sent");
                    break;
                }
                Ok(event) => debug!(?event, "MQTT event"),
                Err(e) => {
                    warn!("MQTT connection error: {}", e);
                    break;
                }
            }
        }

        // Requests made through the client fail from here on
        drop(event_loop);
        notifier.on_disconnected();
    }
}

impl std::fmt::Debug for RumqttcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RumqttcProvider")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MqttProvider for RumqttcProvider {
    async fn connect(&self, token: &str) -> Result<(), ProviderError> {
        let mut session = self.session.lock().await;
        if let Some(stale) = session.take() {
            stale.poll_task.abort();
        }

        let (client, event_loop) =
            AsyncClient::new(self.options.mqtt_options(token), self.options.channel_capacity);
        let packet_ids = SharedPacketIds::default();

        info!(
            host = %self.options.hostname,
            port = self.options.port,
            "Connecting to IoT Hub"
        );
        let span = provider_span!(device_id = %self.options.device_id);
        let poll_task = tokio::spawn(
            Self::poll(event_loop, packet_ids.clone(), self.notifier.clone()).instrument(span),
        );

        *session = Some(Session {
            client,
            packet_ids,
            poll_task,
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<MessageId, ProviderError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(ProviderError::NotConnected)?;

        let message_id = MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst));
        lock(&session.packet_ids).awaiting_pkid.push_back(message_id);

        if let Err(e) = session
            .client
            .publish_bytes(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            lock(&session.packet_ids).forget(message_id);
            return Err(ProviderError::PublishFailed(Box::new(e)));
        }

        debug!(%message_id, topic, "Publish requested");
        Ok(message_id)
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        let mut session = self.session.lock().await;
        session
            .as_ref()
            .ok_or(ProviderError::NotConnected)?
            .client
            .disconnect()
            .await
            .map_err(|e| ProviderError::DisconnectFailed(Box::new(e)))?;

        // The poll task exits once the disconnect packet has been written
        session.take();
        Ok(())
    }
}
