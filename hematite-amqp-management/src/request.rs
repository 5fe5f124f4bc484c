//! The request side of a management operation

use fe2o3_amqp_types::{
    messaging::{ApplicationProperties, IntoBody, Message, Properties},
    primitives::SimpleValue,
};

use crate::{constants, response::Response};

/// A management request.
///
/// `into_message` stamps the `operation`, `type` and `locales` application
/// properties without overwriting entries the request already set itself.
pub trait Request: Sized {
    /// The management operation performed by this request
    const OPERATION: &'static str;

    /// The response expected for this request
    type Response: Response;

    /// The body type of the request message
    type Body: IntoBody;

    /// The manageable entity type of the request.
    ///
    /// This is mandatory for all requests in the working draft; existing
    /// implementations do not all comply, which is why it is an option.
    fn manageable_entity_type(&mut self) -> Option<String> {
        None
    }

    /// The locales of the request
    fn locales(&mut self) -> Option<String> {
        None
    }

    /// Application properties beyond the ones stamped by `into_message`
    fn encode_application_properties(&mut self) -> Option<ApplicationProperties> {
        None
    }

    /// The message properties of the request
    fn encode_properties(&mut self) -> Option<Properties> {
        None
    }

    /// The body of the request message
    fn encode_body(self) -> Self::Body;

    /// Encodes the request into a message
    fn into_message(mut self) -> Message<Self::Body> {
        let mut application_properties = self.encode_application_properties().unwrap_or_default();
        application_properties
            .as_inner_mut()
            .entry(constants::OPERATION.to_string())
            .or_insert(SimpleValue::String(Self::OPERATION.to_string()));
        if let Some(entity_type) = self.manageable_entity_type() {
            application_properties
                .as_inner_mut()
                .entry(constants::TYPE.to_string())
                .or_insert(SimpleValue::String(entity_type));
        }
        if let Some(locales) = self.locales() {
            application_properties
                .as_inner_mut()
                .entry(constants::LOCALES.to_string())
                .or_insert(SimpleValue::String(locales));
        }
        let properties = self.encode_properties();

        Message {
            header: None,
            delivery_annotations: None,
            message_annotations: None,
            properties,
            application_properties: Some(application_properties),
            body: self.encode_body(),
            footer: None,
        }
    }
}
