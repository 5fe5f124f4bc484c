//! Errors of the management client

use fe2o3_amqp_types::messaging::Outcome;
use hematite_amqp::link::{AttachError as LinkAttachError, DetachError, DispositionError, RecvError, SendError};

use crate::status::StatusCode;

/// Error attaching the management link pair
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// The request link failed to attach
    #[error("Error attaching the request link: {0}")]
    Sender(LinkAttachError),

    /// The response link failed to attach
    #[error("Error attaching the response link: {0}")]
    Receiver(LinkAttachError),
}

/// A response carried a status code outside the success window
#[derive(Debug, thiserror::Error)]
#[error("Status {code}: {description:?}")]
pub struct StatusError {
    /// The status code carried in the response
    pub code: StatusCode,

    /// The status description carried in the response
    pub description: Option<String>,
}

/// Error performing a management operation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request was not accepted by the management node
    #[error("Request was not accepted: {0:?}")]
    NotAccepted(Outcome),

    /// Error sending the request
    #[error(transparent)]
    Send(#[from] SendError),

    /// Error receiving the response
    #[error(transparent)]
    Recv(#[from] RecvError),

    /// Error settling the response delivery
    #[error(transparent)]
    Disposition(#[from] DispositionError),

    /// Error detaching the link pair
    #[error(transparent)]
    Detach(#[from] DetachError),

    /// The response carries neither a correlation id nor a message id
    #[error("Correlation ID or Message ID is not found")]
    CorrelationIdAndMessageIdAreNone,

    /// The response does not correlate to the outstanding request
    #[error("Response does not correlate to the outstanding request")]
    CorrelationMismatch,

    /// The response does not carry a status code
    #[error("StatusCode is not found")]
    StatusCodeNotFound,

    /// A field of the response has an unexpected type
    #[error("Invalid type: expected {expected}, found {actual}")]
    InvalidType {
        /// The expected type
        expected: String,

        /// The actual value found
        actual: String,
    },

    /// The response status falls outside the success window
    #[error(transparent)]
    Status(#[from] StatusError),

    /// Error decoding the response body
    #[error("Error decoding from message")]
    DecodeError,
}

/// Convenience alias
pub type Result<T> = std::result::Result<T, Error>;
