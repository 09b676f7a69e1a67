//! Shared access signature tokens
//!
//! `SharedAccessSignature sr={uri}&sig={signature}&se={expiry}[&skn={key_name}]`
//! where the signature is the base64 HMAC-SHA256 of `"{uri}\n{expiry}"`
//! keyed with the base64-decoded shared access key.

use super::AuthError;
use base64::prelude::*;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::Sha256;
use std::fmt;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

static SIGNATURE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sig=[^&\s]+").expect("signature pattern is valid"));

/// A signed token bound to one resource URI and expiry
#[derive(Clone, PartialEq, Eq)]
pub struct SasToken {
    resource_uri: String,
    signature: String,
    expiry: i64,
    key_name: Option<String>,
}

impl SasToken {
    /// Sign `resource_uri` with `key` (base64) for validity up to `expiry`
    /// (seconds since the Unix epoch)
    pub fn sign(
        resource_uri: &str,
        key: &str,
        key_name: Option<&str>,
        expiry: i64,
    ) -> Result<Self, AuthError> {
        let encoded_uri = url_encode(resource_uri);
        let key_bytes = BASE64_STANDARD
            .decode(key.trim())
            .map_err(|_| AuthError::InvalidKey)?;

        let mut mac = HmacSha256::new_from_slice(&key_bytes).map_err(|_| AuthError::InvalidKey)?;
        mac.update(format!("{encoded_uri}\n{expiry}").as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        Ok(Self {
            resource_uri: encoded_uri,
            signature,
            expiry,
            key_name: key_name.map(str::to_string),
        })
    }

    /// Resource URI IoT Hub expects for a device: `{hostname}/devices/{device_id}`
    pub fn device_resource_uri(hostname: &str, device_id: &str) -> String {
        format!("{hostname}/devices/{device_id}")
    }

    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SharedAccessSignature sr={}&sig={}&se={}",
            self.resource_uri,
            url_encode(&self.signature),
            self.expiry
        )?;
        if let Some(key_name) = &self.key_name {
            write!(f, "&skn={}", url_encode(key_name))?;
        }
        Ok(())
    }
}

impl fmt::Debug for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&redact_token(&self.to_string()))
    }
}

/// Replace the signature of any SAS token inside `text` so it can be logged
pub fn redact_token(text: &str) -> String {
    SIGNATURE_PATTERN.replace_all(text, "sig=***").to_string()
}

fn url_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
