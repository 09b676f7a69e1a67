//! Symmetric-key authentication provider

use super::{AuthError, AuthenticationProvider, ConnectionString, SasToken};
use chrono::Utc;
use std::time::Duration;
use tracing::debug;

/// Default validity of a freshly computed token
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Authentication provider signing SAS tokens with a device's shared access key
#[derive(Debug, Clone)]
pub struct SymmetricKeyAuthenticationProvider {
    connection_string: ConnectionString,
    token_ttl: Duration,
}

impl SymmetricKeyAuthenticationProvider {
    pub fn new(connection_string: ConnectionString) -> Self {
        Self {
            connection_string,
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }

    pub fn from_connection_string(connection_string: &str) -> Result<Self, AuthError> {
        Ok(Self::new(ConnectionString::parse(connection_string)?))
    }

    pub fn with_token_ttl(mut self, token_ttl: Duration) -> Self {
        self.token_ttl = token_ttl;
        self
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    pub fn connection_string(&self) -> &ConnectionString {
        &self.connection_string
    }

    /// Sign a token expiring at `expiry` (seconds since the Unix epoch)
    pub fn sign_token(&self, expiry: i64) -> Result<SasToken, AuthError> {
        let cs = &self.connection_string;
        let resource_uri = SasToken::device_resource_uri(&cs.hostname, &cs.device_id);
        SasToken::sign(
            &resource_uri,
            &cs.shared_access_key,
            cs.shared_access_key_name.as_deref(),
            expiry,
        )
    }
}

impl AuthenticationProvider for SymmetricKeyAuthenticationProvider {
    fn hostname(&self) -> &str {
        &self.connection_string.hostname
    }

    fn device_id(&self) -> &str {
        &self.connection_string.device_id
    }

    fn get_current_sas_token(&self) -> Result<String, AuthError> {
        let ttl = i64::try_from(self.token_ttl.as_secs()).unwrap_or(i64::MAX);
        let expiry = Utc::now().timestamp().saturating_add(ttl);
        let token = self.sign_token(expiry)?;

        debug!(device_id = %self.device_id(), expiry, "Computed SAS token");
        Ok(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::from_connection_string;

    const CONNECTION_STRING: &str =
        "HostName=beauxbatons.academy-net;DeviceId=MyPensieve;SharedAccessKey=Zm9vYmFy";

    #[test]
    fn test_from_connection_string() {
        let provider = from_connection_string(CONNECTION_STRING).unwrap();
        assert_eq!(provider.hostname(), "beauxbatons.academy-net");
        assert_eq!(provider.device_id(), "MyPensieve");
        assert_eq!(provider.token_ttl(), DEFAULT_TOKEN_TTL);
    }

    #[test]
    fn test_current_token_expires_after_ttl() {
        let provider = SymmetricKeyAuthenticationProvider::from_connection_string(CONNECTION_STRING)
            .unwrap()
            .with_token_ttl(Duration::from_secs(60));

        let before = Utc::now().timestamp();
        let token = provider.get_current_sas_token().unwrap();
        let after = Utc::now().timestamp();

        let expiry: i64 = token
            .split("&se=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .unwrap()
            .parse()
            .unwrap();
        assert!(expiry >= before + 60 && expiry <= after + 60);
        assert!(token.starts_with("SharedAccessSignature sr=beauxbatons.academy-net%2Fdevices%2FMyPensieve"));
    }

    #[test]
    fn test_sign_token_is_stable_for_fixed_expiry() {
        let provider = from_connection_string(CONNECTION_STRING).unwrap();
        assert_eq!(provider.sign_token(5).unwrap(), provider.sign_token(5).unwrap());
    }

    #[test]
    fn test_invalid_key_surfaces_on_token_request() {
        let provider =
            from_connection_string("HostName=h;DeviceId=d;SharedAccessKey=@@@").unwrap();
        assert_eq!(provider.get_current_sas_token(), Err(AuthError::InvalidKey));
    }
}
