//! Control messages passed from handles to the connection and session event
//! loops

use fe2o3_amqp_types::{definitions::Error, performatives::Disposition};
use tokio::sync::{mpsc, oneshot};

use crate::{
    connection::{AllocSessionError, SessionId},
    link::relay::LinkRelay,
    session::{error::AllocLinkError, frame::SessionIncomingItem},
};

pub(crate) enum ConnectionControl {
    Close(Option<Error>),
    GetRemoteMaxFrameSize(oneshot::Sender<Option<u32>>),
    AllocateSession {
        tx: mpsc::Sender<SessionIncomingItem>,
        responder: oneshot::Sender<Result<(u16, SessionId), AllocSessionError>>,
    },
    AllocateIncomingSession {
        tx: mpsc::Sender<SessionIncomingItem>,
        incoming_channel: u16,
        responder: oneshot::Sender<Result<(u16, SessionId), AllocSessionError>>,
    },
    DeallocateSession(SessionId),
    RejectIncomingSession(u16),
}

impl std::fmt::Display for ConnectionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Close(_) => write!(f, "Close"),
            Self::GetRemoteMaxFrameSize(_) => write!(f, "GetRemoteMaxFrameSize"),
            Self::AllocateSession { .. } => write!(f, "AllocateSession"),
            Self::AllocateIncomingSession { .. } => write!(f, "AllocateIncomingSession"),
            Self::DeallocateSession(id) => write!(f, "DeallocateSession({})", id),
            Self::RejectIncomingSession(channel) => {
                write!(f, "RejectIncomingSession({})", channel)
            }
        }
    }
}

pub(crate) enum SessionControl {
    End(Option<Error>),
    AllocateLink {
        link_name: String,
        link_relay: LinkRelay,
        responder: oneshot::Sender<Result<u32, AllocLinkError>>,
    },
    AllocateIncomingLink {
        link_name: String,
        link_relay: LinkRelay,
        input_handle: u32,
        responder: oneshot::Sender<Result<u32, AllocLinkError>>,
    },
    DeallocateLink(String),
    Disposition(Disposition),
}

impl std::fmt::Display for SessionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::End(_) => write!(f, "End"),
            Self::AllocateLink { .. } => write!(f, "AllocateLink"),
            Self::AllocateIncomingLink { .. } => write!(f, "AllocateIncomingLink"),
            Self::DeallocateLink(name) => write!(f, "DeallocateLink({})", name),
            Self::Disposition(_) => write!(f, "Disposition"),
        }
    }
}
