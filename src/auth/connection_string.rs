//! IoT Hub device connection string parsing
//!
//! Format: `HostName=<host>;DeviceId=<id>;SharedAccessKey=<base64>` with
//! optional `SharedAccessKeyName` and `GatewayHostName` fields. Module
//! identities (`ModuleId`) are rejected.

use super::AuthError;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

const HOST_NAME: &str = "HostName";
const DEVICE_ID: &str = "DeviceId";
const SHARED_ACCESS_KEY: &str = "SharedAccessKey";
const SHARED_ACCESS_KEY_NAME: &str = "SharedAccessKeyName";
const GATEWAY_HOST_NAME: &str = "GatewayHostName";
const MODULE_ID: &str = "ModuleId";

const KNOWN_FIELDS: [&str; 5] = [
    HOST_NAME,
    DEVICE_ID,
    SHARED_ACCESS_KEY,
    SHARED_ACCESS_KEY_NAME,
    GATEWAY_HOST_NAME,
];

/// Parsed device connection string
#[derive(Clone, PartialEq)]
pub struct ConnectionString {
    pub hostname: String,
    pub device_id: String,
    pub shared_access_key: String,
    pub shared_access_key_name: Option<String>,
    pub gateway_hostname: Option<String>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self, AuthError> {
        let mut fields: HashMap<&'static str, String> = HashMap::new();

        for segment in input.trim().split(';').filter(|s| !s.trim().is_empty()) {
            // Values may contain '=' (base64 padding), so split on the first only
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                AuthError::InvalidConnectionString(format!("segment '{segment}' is not Key=Value"))
            })?;
            let key = key.trim();
            if key == MODULE_ID {
                return Err(AuthError::InvalidConnectionString(
                    "module identities (ModuleId) are not supported".to_string(),
                ));
            }

            let known = KNOWN_FIELDS
                .iter()
                .copied()
                .find(|k| *k == key)
                .ok_or_else(|| AuthError::InvalidConnectionString(format!("unknown field '{key}'")))?;

            if fields.insert(known, value.trim().to_string()).is_some() {
                return Err(AuthError::DuplicateField(key.to_string()));
            }
        }

        let mut required = |name: &'static str| -> Result<String, AuthError> {
            fields
                .remove(name)
                .filter(|v| !v.is_empty())
                .ok_or(AuthError::MissingField(name))
        };

        let hostname = required(HOST_NAME)?;
        let device_id = required(DEVICE_ID)?;
        let shared_access_key = required(SHARED_ACCESS_KEY)?;

        Ok(Self {
            hostname,
            device_id,
            shared_access_key,
            shared_access_key_name: fields.remove(SHARED_ACCESS_KEY_NAME),
            gateway_hostname: fields.remove(GATEWAY_HOST_NAME),
        })
    }

    /// Hostname the transport should dial: the gateway if one is configured
    pub fn connect_hostname(&self) -> &str {
        self.gateway_hostname.as_deref().unwrap_or(&self.hostname)
    }
}

impl FromStr for ConnectionString {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// The key never appears in Debug output
impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("hostname", &self.hostname)
            .field("device_id", &self.device_id)
            .field("shared_access_key", &"***")
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("gateway_hostname", &self.gateway_hostname)
            .finish()
    }
}
