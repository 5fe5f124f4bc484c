//! Session error types

use fe2o3_amqp_types::definitions;

/// Error beginning a session
#[derive(Debug, thiserror::Error)]
pub enum BeginError {
    /// The connection state does not permit a new session or the connection
    /// event loop has stopped
    #[error("Illegal connection state")]
    IllegalConnectionState,

    /// All channels permitted by the negotiated channel-max are in use
    #[error("Channel max reached")]
    ChannelMaxReached,

    /// The local session state does not permit a Begin
    #[error("Illegal session state")]
    IllegalState,

    /// The remote peer ended the session during the begin handshake
    #[error("Remote ended the session")]
    RemoteEnded,

    /// The remote peer ended the session with an error
    #[error("Remote ended the session with an error: {0:?}")]
    RemoteEndedWithError(definitions::Error),
}

impl From<crate::connection::AllocSessionError> for BeginError {
    fn from(err: crate::connection::AllocSessionError) -> Self {
        use crate::connection::AllocSessionError;
        match err {
            AllocSessionError::IllegalState => Self::IllegalConnectionState,
            AllocSessionError::ChannelMaxReached => Self::ChannelMaxReached,
            AllocSessionError::EventLoopDropped => Self::IllegalConnectionState,
        }
    }
}

/// Session runtime error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection event loop has stopped
    #[error("Illegal connection state")]
    IllegalConnectionState,

    /// The operation is not valid in the current session state, or the
    /// session has already ended
    #[error("Illegal session state")]
    IllegalState,

    /// A frame arrived for a handle with no attached link
    #[error("The input handle {0} is not attached")]
    UnattachedHandle(u32),

    /// A remote attach arrived for a link name that is not known and no
    /// listener was registered
    #[error("Remote attaching link {0:?} is not found")]
    RemoteAttachingLinkNotFound(String),

    /// The incoming transfer exceeded the granted link credit
    #[error("Transfer limit exceeded")]
    TransferLimitExceeded,

    /// The session event loop stopped or panicked
    #[error("Session event loop has stopped")]
    JoinError,

    /// The remote peer ended the session with an error
    #[error("Remote ended the session with an error: {0:?}")]
    RemoteEndedWithError(definitions::Error),
}

/// Error allocating a link on a session
#[derive(Debug, thiserror::Error)]
pub enum AllocLinkError {
    /// The session state does not permit attaching links
    #[error("Illegal session state")]
    IllegalSessionState,

    /// All handles permitted by handle-max are in use
    #[error("Handle max reached")]
    HandleMaxReached,

    /// The link name is already attached on this session
    #[error("Link name is duplicated")]
    DuplicatedLinkName,
}
