use crate::{frames, sasl_profile};

/// Transport error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Idle timeout has elapsed without any incoming traffic
    #[error("Idle timeout")]
    IdleTimeoutElapsed,

    /// The incoming frame exceeds the negotiated max frame size
    #[error("Max frame size is exceeded")]
    MaxFrameSizeExceeded,

    /// The frame could not be encoded or decoded
    #[error(transparent)]
    FramingError(#[from] serde_amqp::Error),

    /// The frame type or doff is not supported
    #[error("Frame type or doff is not supported")]
    NotImplemented,
}

impl From<frames::Error> for Error {
    fn from(err: frames::Error) -> Self {
        match err {
            frames::Error::Io(err) => Self::Io(err),
            frames::Error::NotImplemented => Self::NotImplemented,
            frames::Error::Codec(err) => Self::FramingError(err),
        }
    }
}

/// Error during the protocol header or SASL negotiation
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The incoming protocol header does not match the locally proposed one
    #[error("Protocol header mismatch: {0:?}")]
    ProtocolHeaderMismatch([u8; 8]),

    /// The incoming stream closed before the negotiation finished
    #[error("Stream closed during negotiation")]
    StreamClosed,

    /// The frame could not be encoded or decoded
    #[error(transparent)]
    FramingError(#[from] serde_amqp::Error),

    /// SASL negotiation failed
    #[error(transparent)]
    SaslError(#[from] sasl_profile::Error),
}

impl From<frames::Error> for NegotiationError {
    fn from(err: frames::Error) -> Self {
        match err {
            frames::Error::Io(err) => Self::Io(err),
            frames::Error::NotImplemented => Self::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Frame type or doff is not supported",
            )),
            frames::Error::Codec(err) => Self::FramingError(err),
        }
    }
}
