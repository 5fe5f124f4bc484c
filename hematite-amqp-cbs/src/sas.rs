//! Shared access signature credential parsed from a connection string

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use fe2o3_amqp_types::primitives::Timestamp;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{
    token::{CbsToken, CbsTokenType},
    CbsTokenProvider,
};

/// Tokens are valid for 60 minutes unless configured otherwise
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// Error building or using a SAS credential
#[derive(Debug, thiserror::Error)]
pub enum SasCredentialError {
    /// A required field is missing from the connection string
    #[error("Connection string is missing field {0}")]
    MissingField(&'static str),

    /// A field appears twice in the connection string
    #[error("Connection string field {0} is duplicated")]
    DuplicatedField(&'static str),

    /// A segment of the connection string is not a key=value pair
    #[error("Malformed connection string segment: {0:?}")]
    MalformedSegment(String),

    /// The system clock is set before the unix epoch
    #[error("System time is before the unix epoch")]
    InvalidSystemTime,
}

/// A shared access signature credential parsed from a connection string of
/// the form
/// `Endpoint=sb://<host>/;SharedAccessKeyName=<name>;SharedAccessKey=<key>;EntityPath=<path>`.
///
/// Generates time bounded SAS tokens on demand; the audience of a
/// generated token is the endpoint joined with the entity path.
#[derive(Debug, Clone)]
pub struct SasCredential {
    endpoint: String,
    key_name: String,
    key: String,
    entity_path: Option<String>,
    token_validity: Duration,
}

impl SasCredential {
    /// Parses a connection string into a credential
    pub fn parse(connection_string: &str) -> Result<Self, SasCredentialError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for segment in connection_string.split(';') {
            if segment.is_empty() {
                continue;
            }
            let (field, value) = segment
                .split_once('=')
                .ok_or_else(|| SasCredentialError::MalformedSegment(segment.to_string()))?;
            let slot = match field {
                "Endpoint" => &mut endpoint,
                "SharedAccessKeyName" => &mut key_name,
                "SharedAccessKey" => &mut key,
                "EntityPath" => &mut entity_path,
                // Unknown fields are ignored for forward compatibility
                _ => continue,
            };
            if slot.is_some() {
                return Err(SasCredentialError::DuplicatedField(match field {
                    "Endpoint" => "Endpoint",
                    "SharedAccessKeyName" => "SharedAccessKeyName",
                    "SharedAccessKey" => "SharedAccessKey",
                    _ => "EntityPath",
                }));
            }
            *slot = Some(value.to_string());
        }

        Ok(Self {
            endpoint: endpoint.ok_or(SasCredentialError::MissingField("Endpoint"))?,
            key_name: key_name.ok_or(SasCredentialError::MissingField("SharedAccessKeyName"))?,
            key: key.ok_or(SasCredentialError::MissingField("SharedAccessKey"))?,
            entity_path,
            token_validity: DEFAULT_TOKEN_VALIDITY,
        })
    }

    /// Overrides how long generated tokens stay valid
    pub fn set_token_validity(&mut self, validity: Duration) {
        self.token_validity = validity;
    }

    /// The endpoint of the credential
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The audience tokens are generated for: the endpoint joined with the
    /// entity path
    pub fn audience(&self) -> String {
        match &self.entity_path {
            Some(path) => format!(
                "{}/{}",
                self.endpoint.trim_end_matches('/'),
                path.trim_start_matches('/')
            ),
            None => self.endpoint.clone(),
        }
    }

    /// Generates a SAS token for the resource valid for the configured
    /// duration starting now
    pub fn generate_sas_token(&self, resource: &str) -> Result<(String, Timestamp), SasCredentialError> {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| SasCredentialError::InvalidSystemTime)?
            + self.token_validity;
        self.generate_sas_token_with_expiry(resource, expiry.as_secs())
    }

    /// Generates a SAS token for the resource expiring at the given
    /// seconds since the unix epoch
    pub fn generate_sas_token_with_expiry(
        &self,
        resource: &str,
        expiry_secs: u64,
    ) -> Result<(String, Timestamp), SasCredentialError> {
        let encoded_resource = url_encode(resource);
        let string_to_sign = format!("{}\n{}", encoded_resource, expiry_secs);

        let mut mac = Hmac::<Sha256>::new_from_slice(self.key.as_bytes())
            .expect("HMAC accepts keys of any size");
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        let token = format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_resource,
            url_encode(&signature),
            expiry_secs,
            self.key_name,
        );
        let expires_at = Timestamp::from_milliseconds((expiry_secs as i64) * 1000);
        Ok((token, expires_at))
    }
}

impl CbsTokenProvider for SasCredential {
    type Error = SasCredentialError;

    fn get_token(
        &mut self,
        resource_id: impl AsRef<str>,
        _claims: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<CbsToken<'_>, Self::Error> {
        let (token, expires_at) = self.generate_sas_token(resource_id.as_ref())?;
        // The put-token path currently submits every supported token as a
        // JWT typed put-token, which is what the services consuming this
        // crate accept
        Ok(CbsToken::new(token, CbsTokenType::Jwt, Some(expires_at)))
    }
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{SasCredential, SasCredentialError};

    const CONNECTION_STRING: &str = "Endpoint=sb://example.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=superSecretKey;EntityPath=eventhub-1";

    #[test]
    fn connection_string_fields_are_parsed() {
        let credential = SasCredential::parse(CONNECTION_STRING).unwrap();
        assert_eq!(credential.endpoint(), "sb://example.servicebus.windows.net/");
        assert_eq!(credential.key_name, "RootManageSharedAccessKey");
        assert_eq!(credential.key, "superSecretKey");
        assert_eq!(credential.entity_path.as_deref(), Some("eventhub-1"));
    }

    #[test]
    fn audience_joins_endpoint_and_entity_path() {
        let credential = SasCredential::parse(CONNECTION_STRING).unwrap();
        assert_eq!(
            credential.audience(),
            "sb://example.servicebus.windows.net/eventhub-1"
        );
    }

    #[test]
    fn missing_key_is_rejected() {
        let result = SasCredential::parse("Endpoint=sb://example.net/;SharedAccessKeyName=name");
        assert!(matches!(
            result,
            Err(SasCredentialError::MissingField("SharedAccessKey"))
        ));
    }

    #[test]
    fn malformed_segment_is_rejected() {
        let result = SasCredential::parse("Endpoint=sb://example.net/;bogus");
        assert!(matches!(
            result,
            Err(SasCredentialError::MalformedSegment(_))
        ));
    }

    #[test]
    fn generated_token_carries_all_sas_fields() {
        let credential = SasCredential::parse(CONNECTION_STRING).unwrap();
        let (token, _expiry) = credential
            .generate_sas_token_with_expiry(&credential.audience(), 1_700_000_000)
            .unwrap();

        assert!(token.starts_with("SharedAccessSignature sr="));
        assert!(token.contains("&sig="));
        assert!(token.contains("&se=1700000000"));
        assert!(token.ends_with("&skn=RootManageSharedAccessKey"));
    }

    #[test]
    fn token_signature_is_deterministic_for_fixed_expiry() {
        let credential = SasCredential::parse(CONNECTION_STRING).unwrap();
        let (a, _) = credential
            .generate_sas_token_with_expiry("sb://example.net/entity", 1_700_000_000)
            .unwrap();
        let (b, _) = credential
            .generate_sas_token_with_expiry("sb://example.net/entity", 1_700_000_000)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn default_validity_is_sixty_minutes() {
        assert_eq!(super::DEFAULT_TOKEN_VALIDITY, Duration::from_secs(3600));
    }
}
