//! The put-token operation of the CBS draft

use std::borrow::Cow;

use fe2o3_amqp_types::{
    messaging::{ApplicationProperties, Message},
    primitives::{SimpleValue, Timestamp, Value},
};
use hematite_amqp_management::{
    constants::{NAME, TYPE},
    error::Error as MgmtError,
    request::Request,
    response::Response,
};

use crate::constants::{EXPIRATION, PUT_TOKEN};

/// Puts a token for the audience named in the `name` application property.
///
/// The token itself is the message body; the expiration is carried as a
/// timestamp application property.
#[derive(Debug)]
pub struct PutTokenRequest<'a> {
    /// The audience the token grants claims on
    pub name: Cow<'a, str>,

    /// The token
    pub token: Cow<'a, str>,

    /// When the token expires
    pub expiration: Option<Timestamp>,

    /// The wire name of the token type
    pub token_type: Cow<'a, str>,
}

impl<'a> PutTokenRequest<'a> {
    /// Creates a new put-token request
    pub fn new(
        name: impl Into<Cow<'a, str>>,
        token: impl Into<Cow<'a, str>>,
        expiration: impl Into<Option<Timestamp>>,
        token_type: impl Into<Cow<'a, str>>,
    ) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            expiration: expiration.into(),
            token_type: token_type.into(),
        }
    }
}

impl Request for PutTokenRequest<'_> {
    const OPERATION: &'static str = PUT_TOKEN;

    type Response = PutTokenResponse;
    type Body = String;

    fn encode_application_properties(&mut self) -> Option<ApplicationProperties> {
        let expiration = match &self.expiration {
            Some(timestamp) => SimpleValue::Timestamp(timestamp.clone()),
            None => SimpleValue::Null,
        };
        Some(
            ApplicationProperties::builder()
                .insert(TYPE, SimpleValue::String(self.token_type.to_string()))
                .insert(NAME, self.name.to_string())
                .insert(EXPIRATION, expiration)
                .build(),
        )
    }

    fn encode_body(self) -> Self::Body {
        self.token.into_owned()
    }
}

/// The response to a put-token request carries no information beyond its
/// status
#[derive(Debug)]
pub struct PutTokenResponse {}

impl Response for PutTokenResponse {
    const STATUS_CODE: u16 = 202;

    type Body = Option<Value>;

    fn from_message(_message: Message<Self::Body>) -> Result<Self, MgmtError> {
        Ok(Self {})
    }
}
