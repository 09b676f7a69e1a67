//! Mock implementations for testing
//!
//! Provides a recording [`MockProvider`] and a [`MockAuthProvider`] so the
//! transport can be exercised without a broker or real credentials.

use crate::auth::{AuthError, AuthenticationProvider};
use crate::transport::{MessageId, MqttProvider, ProviderError, ProviderNotifier};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

pub type PublishedMessage = (String, Bytes);

/// Mock transport provider recording every call made into it
///
/// Message identifiers are issued sequentially from 0. When built with a
/// notifier and auto-responses enabled, the mock raises the matching
/// notification from inside the call, which exercises nested delivery.
#[derive(Debug, Default)]
pub struct MockProvider {
    connect_tokens: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    disconnect_count: AtomicUsize,
    next_message_id: AtomicU64,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    fail_disconnect: AtomicBool,
    notifier: Option<ProviderNotifier>,
    auto_respond: bool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock that keeps a notifier but only raises notifications when a test asks
    pub fn with_notifier(notifier: ProviderNotifier) -> Self {
        Self {
            notifier: Some(notifier),
            ..Default::default()
        }
    }

    /// Mock that immediately raises connected/published/disconnected from
    /// inside the corresponding call
    pub fn responsive(notifier: ProviderNotifier) -> Self {
        Self {
            notifier: Some(notifier),
            auto_respond: true,
            ..Default::default()
        }
    }

    pub fn notifier(&self) -> Option<&ProviderNotifier> {
        self.notifier.as_ref()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub fn connect_tokens(&self) -> Vec<String> {
        self.connect_tokens.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connect_tokens.lock().unwrap().len()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnect_count.load(Ordering::SeqCst)
    }

    /// Forget recorded calls and restart message identifiers at 0
    pub fn reset(&self) {
        self.connect_tokens.lock().unwrap().clear();
        self.published.lock().unwrap().clear();
        self.disconnect_count.store(0, Ordering::SeqCst);
        self.next_message_id.store(0, Ordering::SeqCst);
    }

    fn auto_notifier(&self) -> Option<&ProviderNotifier> {
        self.notifier.as_ref().filter(|_| self.auto_respond)
    }
}

#[async_trait]
impl MqttProvider for MockProvider {
    async fn connect(&self, token: &str) -> Result<(), ProviderError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ProviderError::ConnectionFailed("Mock connection failure".into()));
        }

        self.connect_tokens.lock().unwrap().push(token.to_string());
        if let Some(notifier) = self.auto_notifier() {
            notifier.on_connected();
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<MessageId, ProviderError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(ProviderError::PublishFailed("Mock publish failure".into()));
        }

        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        let message_id = MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst));

        if let Some(notifier) = self.auto_notifier() {
            notifier.on_published(message_id);
        }
        Ok(message_id)
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(ProviderError::DisconnectFailed("Mock disconnect failure".into()));
        }

        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        if let Some(notifier) = self.auto_notifier() {
            notifier.on_disconnected();
        }
        Ok(())
    }
}

/// Mock authentication provider returning a fixed token
#[derive(Debug)]
pub struct MockAuthProvider {
    device_id: String,
    should_fail: bool,
    token_requests: AtomicUsize,
}

impl MockAuthProvider {
    pub const HOSTNAME: &'static str = "beauxbatons.academy-net";

    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            should_fail: false,
            token_requests: AtomicUsize::new(0),
        }
    }

    pub fn failing(device_id: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            ..Self::new(device_id)
        }
    }

    /// The token every successful request returns
    pub fn token(&self) -> String {
        format!(
            "SharedAccessSignature sr={}%2Fdevices%2F{}&sig=mock&se=0",
            Self::HOSTNAME,
            self.device_id
        )
    }

    pub fn token_requests(&self) -> usize {
        self.token_requests.load(Ordering::SeqCst)
    }
}

impl AuthenticationProvider for MockAuthProvider {
    fn hostname(&self) -> &str {
        Self::HOSTNAME
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn get_current_sas_token(&self) -> Result<String, AuthError> {
        self.token_requests.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err(AuthError::InvalidKey);
        }
        Ok(self.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_provider_issues_sequential_ids() {
        let provider = MockProvider::new();

        let first = provider.publish("t", Bytes::from_static(b"a")).await.unwrap();
        let second = provider.publish("t", Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(first, MessageId(0));
        assert_eq!(second, MessageId(1));

        provider.reset();
        assert!(provider.published().is_empty());
        assert_eq!(
            provider.publish("t", Bytes::new()).await.unwrap(),
            MessageId(0)
        );
    }

    #[tokio::test]
    async fn test_responsive_mock_raises_notifications() {
        let (notifier, mut rx) = ProviderNotifier::channel();
        let provider = MockProvider::responsive(notifier);

        provider.connect("token").await.unwrap();
        let id = provider.publish("t", Bytes::new()).await.unwrap();
        provider.disconnect().await.unwrap();

        use crate::transport::ProviderEvent;
        assert_eq!(rx.recv().await, Some(ProviderEvent::Connected));
        assert_eq!(rx.recv().await, Some(ProviderEvent::Published(id)));
        assert_eq!(rx.recv().await, Some(ProviderEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_failures_are_not_recorded() {
        let provider = MockProvider::new();
        provider.fail_connect(true);
        provider.fail_disconnect(true);

        assert!(provider.connect("token").await.is_err());
        assert!(provider.disconnect().await.is_err());
        assert_eq!(provider.connect_count(), 0);
        assert_eq!(provider.disconnect_count(), 0);
    }

    #[test]
    fn test_mock_auth_counts_requests() {
        let auth = MockAuthProvider::new("dev");
        assert_eq!(auth.get_current_sas_token().unwrap(), auth.token());
        assert_eq!(auth.token_requests(), 1);

        let failing = MockAuthProvider::failing("dev");
        assert!(failing.get_current_sas_token().is_err());
    }
}
