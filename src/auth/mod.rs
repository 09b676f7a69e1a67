//! Device authentication
//!
//! The transport only needs a fresh SAS token per connect; this module
//! provides the trait it consumes and a symmetric-key implementation built
//! from an IoT Hub device connection string.

pub mod connection_string;
pub mod sas_token;
pub mod symmetric_key;

use thiserror::Error;

pub use connection_string::ConnectionString;
pub use sas_token::{redact_token, SasToken};
pub use symmetric_key::SymmetricKeyAuthenticationProvider;

/// Source of the credentials used to open a device connection
pub trait AuthenticationProvider: Send + Sync {
    /// IoT Hub hostname the device connects to
    fn hostname(&self) -> &str;

    /// Identity of the device; fixed for the provider's lifetime
    fn device_id(&self) -> &str;

    /// Produce a token valid from now; never cached by callers
    fn get_current_sas_token(&self) -> Result<String, AuthError>;
}

/// Authentication and connection string errors
#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("Connection string is missing required field: {0}")]
    MissingField(&'static str),
    #[error("Connection string field appears more than once: {0}")]
    DuplicateField(String),
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("Shared access key is not valid base64")]
    InvalidKey,
}

/// Construct an authentication provider from a device connection string
pub fn from_connection_string(
    connection_string: &str,
) -> Result<SymmetricKeyAuthenticationProvider, AuthError> {
    SymmetricKeyAuthenticationProvider::from_connection_string(connection_string)
}
