//! The READ operation: retrieve the attributes of a manageable entity

use std::borrow::Cow;

use fe2o3_amqp_types::{
    messaging::{ApplicationProperties, Message},
    primitives::{OrderedMap, Value},
};

use crate::{constants, error::Error, request::Request, response::Response};

/// Retrieve the attributes of the manageable entity addressed by name or
/// identity
#[derive(Debug)]
pub struct ReadRequest<'a> {
    key: &'static str,
    value: Cow<'a, str>,
    entity_type: Cow<'a, str>,
    locales: Option<Cow<'a, str>>,
}

impl<'a> ReadRequest<'a> {
    /// Reads the entity addressed by its name
    pub fn name(
        name: impl Into<Cow<'a, str>>,
        entity_type: impl Into<Cow<'a, str>>,
        locales: impl Into<Option<Cow<'a, str>>>,
    ) -> Self {
        Self {
            key: constants::NAME,
            value: name.into(),
            entity_type: entity_type.into(),
            locales: locales.into(),
        }
    }

    /// Reads the entity addressed by its identity
    pub fn identity(
        identity: impl Into<Cow<'a, str>>,
        entity_type: impl Into<Cow<'a, str>>,
        locales: impl Into<Option<Cow<'a, str>>>,
    ) -> Self {
        Self {
            key: constants::IDENTITY,
            value: identity.into(),
            entity_type: entity_type.into(),
            locales: locales.into(),
        }
    }
}

impl Request for ReadRequest<'_> {
    const OPERATION: &'static str = constants::READ;

    type Response = ReadResponse;
    type Body = ();

    fn manageable_entity_type(&mut self) -> Option<String> {
        Some(self.entity_type.to_string())
    }

    fn locales(&mut self) -> Option<String> {
        self.locales.as_ref().map(|l| l.to_string())
    }

    fn encode_application_properties(&mut self) -> Option<ApplicationProperties> {
        Some(
            ApplicationProperties::builder()
                .insert(self.key, self.value.to_string())
                .build(),
        )
    }

    fn encode_body(self) -> Self::Body {}
}

/// The attributes of the entity as a map
#[derive(Debug)]
pub struct ReadResponse {
    /// The attributes of the entity
    pub entity_attributes: OrderedMap<String, Value>,
}

impl Response for ReadResponse {
    const STATUS_CODE: u16 = 200;

    type Body = Option<OrderedMap<String, Value>>;

    fn from_message(message: Message<Self::Body>) -> Result<Self, Error> {
        match message.body {
            Some(entity_attributes) => Ok(Self { entity_attributes }),
            None => Ok(Self {
                entity_attributes: OrderedMap::with_capacity(0),
            }),
        }
    }
}
