//! Integration tests for connection strings and SAS token generation


use iothub_device::auth::{
    from_connection_string, redact_token, AuthError, AuthenticationProvider, ConnectionString,
    SasToken, SymmetricKeyAuthenticationProvider,
};
use test_helpers::CONNECTION_STRING;

const EXPECTED_SIGNATURE: &str = "4T6mF+3YO4E/ACMPyfF/5agxL3jzIrUm4IEdI59uOSI=";

#[test]
fn test_known_signature() {
    // Arrange
    let provider = from_connection_string(CONNECTION_STRING).unwrap();

    // Act
    let token = provider.sign_token(1_700_000_000).unwrap();

    // Assert
    assert_eq!(token.signature(), EXPECTED_SIGNATURE);
    assert_eq!(
        token.to_string(),
        "SharedAccessSignature sr=beauxbatons.academy-net%2Fdevices%2FMyPensieve\
         &sig=4T6mF%2B3YO4E%2FACMPyfF%2F5agxL3jzIrUm4IEdI59uOSI%3D&se=1700000000"
    );
}

#[test]
fn test_sign_matches_provider() {
    let uri = SasToken::device_resource_uri("beauxbatons.academy-net", "MyPensieve");
    let token = SasToken::sign(&uri, "Zm9vYmFy", None, 1_700_000_000).unwrap();

    assert_eq!(token.signature(), EXPECTED_SIGNATURE);
    assert_eq!(token.expiry(), 1_700_000_000);
}

#[test]
fn test_provider_exposes_identity() {
    let provider = SymmetricKeyAuthenticationProvider::from_connection_string(CONNECTION_STRING)
        .unwrap();

    assert_eq!(provider.hostname(), "beauxbatons.academy-net");
    assert_eq!(provider.device_id(), "MyPensieve");
    assert!(provider
        .get_current_sas_token()
        .unwrap()
        .starts_with("SharedAccessSignature sr="));
}

#[test]
fn test_tokens_are_safe_to_log() {
    let provider = from_connection_string(CONNECTION_STRING).unwrap();
    let token = provider.sign_token(1_700_000_000).unwrap();

    let logged = format!("{token:?}");
    assert!(!logged.contains("4T6mF"));
    assert_eq!(
        redact_token(&token.to_string()),
        "SharedAccessSignature sr=beauxbatons.academy-net%2Fdevices%2FMyPensieve&sig=***&se=1700000000"
    );
    assert!(!format!("{:?}", provider.connection_string()).contains("Zm9vYmFy"));
}

#[test]
fn test_malformed_connection_strings() {
    let cases = [
        ("DeviceId=d;SharedAccessKey=a2V5", AuthError::MissingField("HostName")),
        ("HostName=h;SharedAccessKey=a2V5", AuthError::MissingField("DeviceId")),
        ("HostName=h;DeviceId=d", AuthError::MissingField("SharedAccessKey")),
    ];

    for (input, expected) in cases {
        assert_eq!(
            ConnectionString::parse(input).unwrap_err(),
            expected,
            "Failed for input: {input}"
        );
    }

    assert!(matches!(
        ConnectionString::parse("HostName=h;HostName=i;DeviceId=d;SharedAccessKey=a2V5"),
        Err(AuthError::DuplicateField(_))
    ));
    assert!(matches!(
        ConnectionString::parse("HostName=h;DeviceId=d;SharedAccessKey=a2V5;Colour=red"),
        Err(AuthError::InvalidConnectionString(_))
    ));
}
