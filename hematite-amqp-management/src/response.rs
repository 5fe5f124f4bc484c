//! The response side of a management operation

use fe2o3_amqp_types::messaging::{FromBody, Message};

use crate::{
    constants::{LEGACY_STATUS_CODE, LEGACY_STATUS_DESCRIPTION, STATUS_CODE, STATUS_DESCRIPTION},
    error::Error,
    status::StatusCode,
};

/// A management response.
///
/// The status fields are extracted from the `statusCode` and
/// `statusDescription` application properties, with a fallback to the
/// hyphenated keys several existing services use instead.
pub trait Response: Sized {
    /// The status code this response reports on success
    const STATUS_CODE: u16;

    /// The body type of the response message
    type Body: for<'de> FromBody<'de>;

    /// Decodes the response from the received message; the status
    /// properties have already been removed and judged by the client
    fn from_message(message: Message<Self::Body>) -> Result<Self, Error>;
}

/// Removes the status code and description from the application properties
/// of a response message
pub(crate) fn take_status<B>(
    message: &mut Message<B>,
) -> Result<(StatusCode, Option<String>), Error> {
    let application_properties = message
        .application_properties
        .as_mut()
        .ok_or(Error::StatusCodeNotFound)?;

    let value = application_properties
        .as_inner_mut()
        .remove(STATUS_CODE)
        .or_else(|| application_properties.as_inner_mut().remove(LEGACY_STATUS_CODE))
        .ok_or(Error::StatusCodeNotFound)?;
    let code = StatusCode::try_from(&value).map_err(|_| Error::InvalidType {
        expected: "u16".to_string(),
        actual: format!("{:?}", value),
    })?;

    let description = match application_properties
        .as_inner_mut()
        .remove(STATUS_DESCRIPTION)
        .or_else(|| {
            application_properties
                .as_inner_mut()
                .remove(LEGACY_STATUS_DESCRIPTION)
        }) {
        Some(value) => Some(String::try_from(value).map_err(|actual| Error::InvalidType {
            expected: "String".to_string(),
            actual: format!("{:?}", actual),
        })?),
        None => None,
    };

    Ok((code, description))
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::{
        messaging::{ApplicationProperties, Message},
        primitives::{SimpleValue, Value},
    };

    use super::take_status;

    fn response_message(code_key: &str, code: SimpleValue) -> Message<Value> {
        Message {
            header: None,
            delivery_annotations: None,
            message_annotations: None,
            properties: None,
            application_properties: Some(
                ApplicationProperties::builder()
                    .insert(code_key, code)
                    .insert("statusDescription", "OK")
                    .build(),
            ),
            body: Value::Null,
            footer: None,
        }
    }

    #[test]
    fn status_is_taken_from_the_draft_key() {
        let mut message = response_message("statusCode", SimpleValue::Int(200));
        let (code, description) = take_status(&mut message).unwrap();
        assert_eq!(code.0.get(), 200);
        assert_eq!(description.as_deref(), Some("OK"));
    }

    #[test]
    fn status_falls_back_to_the_legacy_key() {
        let mut message = response_message("status-code", SimpleValue::Int(202));
        let (code, _) = take_status(&mut message).unwrap();
        assert_eq!(code.0.get(), 202);
    }

    #[test]
    fn missing_status_code_is_an_error() {
        let mut message = response_message("unrelated", SimpleValue::Int(1));
        assert!(take_status(&mut message).is_err());
    }
}
