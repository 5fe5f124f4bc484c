use fe2o3_amqp_types::definitions;

use crate::transport;

/// Error opening a connection
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Error parsing the url
    #[error(transparent)]
    UrlError(#[from] url::ParseError),

    /// The url scheme is neither `amqp` nor `amqps`
    #[error("Invalid scheme: {0}. Only \"amqp\" and \"amqps\" are supported")]
    InvalidScheme(String),

    /// The url is missing a resolvable domain
    #[error("Invalid domain")]
    InvalidDomain,

    /// A SASL profile was configured together with an explicitly supplied
    /// stream. The profile implies a SASL-negotiated transport that the
    /// caller did not hand over, so the combination is rejected before any
    /// IO takes place.
    #[error("A SASL profile cannot be combined with an explicitly supplied transport")]
    SaslWithExplicitTransport,

    /// An `amqps` url requires an externally established TLS stream
    #[error("TLS streams are established externally; open one and use `open_with_stream`")]
    TlsConnectorNotFound,

    /// The incoming protocol header does not match
    #[error("Protocol header mismatch {0:?}")]
    ProtocolHeaderMismatch([u8; 8]),

    /// SASL negotiation failed
    #[error(transparent)]
    SaslError(#[from] crate::sasl_profile::Error),

    /// The transport failed before the open handshake completed
    #[error(transparent)]
    TransportError(#[from] transport::Error),

    /// An illegal connection state was reached during the handshake
    #[error("Illegal connection state")]
    IllegalState,

    /// The remote peer answered the open handshake with a Close frame
    #[error("Remote peer closed the connection during open: {0:?}")]
    RemoteClosed(Option<definitions::Error>),
}

impl From<transport::NegotiationError> for OpenError {
    fn from(err: transport::NegotiationError) -> Self {
        use transport::NegotiationError;
        match err {
            NegotiationError::Io(err) => Self::Io(err),
            NegotiationError::ProtocolHeaderMismatch(buf) => Self::ProtocolHeaderMismatch(buf),
            NegotiationError::StreamClosed => Self::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Stream closed during negotiation",
            )),
            NegotiationError::FramingError(err) => {
                Self::TransportError(transport::Error::FramingError(err))
            }
            NegotiationError::SaslError(err) => Self::SaslError(err),
        }
    }
}

/// Connection runtime error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The remote has been silent for longer than its announced idle timeout
    #[error("Idle timeout")]
    IdleTimeoutElapsed,

    /// Frame encode or decode error
    #[error(transparent)]
    FramingError(#[from] serde_amqp::Error),

    /// The connection event loop stopped or panicked
    #[error("Connection event loop has stopped")]
    JoinError,

    /// The operation is not valid in the current connection state, or the
    /// connection has already been closed
    #[error("Illegal connection state")]
    IllegalState,

    /// A frame arrived for a channel with no mapped session
    #[error("Session channel {0} is not found")]
    SessionChannelNotFound(u16),

    /// The peer requested something this implementation does not provide
    #[error("Not implemented: {0:?}")]
    NotImplemented(Option<String>),

    /// The remote peer closed the connection with an error
    #[error("Remote closed the connection with an error: {0:?}")]
    RemoteClosedWithError(definitions::Error),
}

impl From<transport::Error> for Error {
    fn from(err: transport::Error) -> Self {
        match err {
            transport::Error::Io(err) => Self::Io(err),
            transport::Error::IdleTimeoutElapsed => Self::IdleTimeoutElapsed,
            transport::Error::MaxFrameSizeExceeded => Self::NotImplemented(Some(
                "Peer exceeded the negotiated max frame size".to_string(),
            )),
            transport::Error::FramingError(err) => Self::FramingError(err),
            transport::Error::NotImplemented => Self::NotImplemented(None),
        }
    }
}

/// Error allocating a new session
#[derive(Debug, thiserror::Error)]
pub enum AllocSessionError {
    /// The connection state does not permit new sessions
    #[error("Illegal connection state")]
    IllegalState,

    /// All channels permitted by the negotiated channel-max are in use
    #[error("Channel max reached")]
    ChannelMaxReached,

    /// The connection event loop has stopped
    #[error("Connection event loop has stopped")]
    EventLoopDropped,
}
