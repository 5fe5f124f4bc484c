//! CBS token types

use std::borrow::Cow;

use fe2o3_amqp_types::primitives::Timestamp;

use crate::constants::{CBS_TOKEN_TYPE_JWT, CBS_TOKEN_TYPE_SAS};

/// The type of a CBS token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CbsTokenType {
    /// A JSON web token
    Jwt,

    /// A service bus SAS token
    Sas,
}

impl CbsTokenType {
    /// The wire name of the token type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jwt => CBS_TOKEN_TYPE_JWT,
            Self::Sas => CBS_TOKEN_TYPE_SAS,
        }
    }
}

impl std::fmt::Display for CbsTokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A CBS token together with its type and expiry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CbsToken<'a> {
    pub(crate) token_value: Cow<'a, str>,
    pub(crate) token_type: CbsTokenType,
    pub(crate) expires_at_utc: Option<Timestamp>,
}

impl<'a> CbsToken<'a> {
    /// Creates a new CBS token
    pub fn new(
        token_value: impl Into<Cow<'a, str>>,
        token_type: CbsTokenType,
        expires_at_utc: impl Into<Option<Timestamp>>,
    ) -> Self {
        Self {
            token_value: token_value.into(),
            token_type,
            expires_at_utc: expires_at_utc.into(),
        }
    }

    /// The token value
    pub fn token_value(&self) -> &str {
        &self.token_value
    }

    /// The token type
    pub fn token_type(&self) -> CbsTokenType {
        self.token_type
    }

    /// The expiration time
    pub fn expires_at_utc(&self) -> &Option<Timestamp> {
        &self.expires_at_utc
    }
}
