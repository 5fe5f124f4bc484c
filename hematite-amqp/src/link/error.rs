use fe2o3_amqp_types::{
    definitions,
    messaging::{Modified, Rejected, Released},
};

/// The operation is not valid for the current link state
#[derive(Debug, thiserror::Error)]
pub enum IllegalLinkStateError {
    /// Negotiable link properties cannot change once the link attached
    #[error("The property cannot be set after the link has attached")]
    AlreadyAttached,

    /// Peer populated properties are only available after the attach
    /// handshake
    #[error("The property is only available after the link has attached")]
    NotYetAttached,
}

/// Error attaching a link
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// The session state does not permit attaching links or the session
    /// event loop has stopped
    #[error("Illegal session state")]
    IllegalSessionState,

    /// The link name is already attached on the session
    #[error("Link name is duplicated")]
    DuplicatedLinkName,

    /// All handles permitted by handle-max are in use
    #[error("Handle max reached")]
    HandleMaxReached,

    /// The role of the supplied link does not match the endpoint
    #[error("The role of the link does not match the endpoint")]
    RoleMismatch,

    /// The remote peer answered the attach with a detach
    #[error("Remote peer refused the attach: {0:?}")]
    RefusedByRemote(Option<definitions::Error>),

    /// A frame other than attach or detach arrived during the handshake
    #[error("Illegal link state")]
    IllegalState,
}

impl From<crate::session::error::AllocLinkError> for AttachError {
    fn from(err: crate::session::error::AllocLinkError) -> Self {
        use crate::session::error::AllocLinkError;
        match err {
            AllocLinkError::IllegalSessionState => Self::IllegalSessionState,
            AllocLinkError::HandleMaxReached => Self::HandleMaxReached,
            AllocLinkError::DuplicatedLinkName => Self::DuplicatedLinkName,
        }
    }
}

/// Error detaching or closing a link
#[derive(Debug, thiserror::Error)]
pub enum DetachError {
    /// The session event loop has stopped
    #[error("Illegal session state")]
    IllegalSessionState,

    /// The link is not in a state that can be detached
    #[error("Illegal link state")]
    IllegalState,

    /// The remote detached with an error
    #[error("Remote detached with an error: {0:?}")]
    RemoteDetachedWithError(definitions::Error),

    /// A non-closing detach was answered with a closing detach
    #[error("Remote peer closed the link while a non-closing detach was expected")]
    ClosedByRemote,

    /// A closing detach was answered with a non-closing detach
    #[error("Remote peer detached the link while a closing detach was expected")]
    DetachedByRemote,
}

/// Error sending a message
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The session event loop has stopped
    #[error("Illegal session state")]
    IllegalSessionState,

    /// The link is not attached
    #[error("Illegal link state")]
    IllegalState,

    /// The message could not be encoded
    #[error(transparent)]
    MessageEncodeError(#[from] serde_amqp::Error),

    /// The remote detached the link while a send was outstanding
    #[error("Remote detached with an error: {0:?}")]
    RemoteDetachedWithError(Option<definitions::Error>),

    /// The delivery was rejected by the receiver
    #[error("Outcome Rejected: {0:?}")]
    Rejected(Rejected),

    /// The delivery was released by the receiver
    #[error("Outcome Released: {0:?}")]
    Released(Released),

    /// The delivery was modified by the receiver
    #[error("Outcome Modified: {0:?}")]
    Modified(Modified),

    /// The outcome did not arrive within the given duration
    #[error("The delivery outcome did not arrive in time")]
    Timeout,
}

/// Error receiving a message
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// The session event loop has stopped
    #[error("Illegal session state")]
    IllegalSessionState,

    /// The link is not attached
    #[error("Illegal link state")]
    IllegalState,

    /// The message could not be decoded
    #[error(transparent)]
    MessageDecodeError(#[from] serde_amqp::Error),

    /// The remote peer detached the link
    #[error("Remote detached: {0:?}")]
    RemoteDetached(Option<definitions::Error>),
}

/// Error sending a disposition
#[derive(Debug, thiserror::Error)]
pub enum DispositionError {
    /// The session event loop has stopped
    #[error("Illegal session state")]
    IllegalSessionState,
}
