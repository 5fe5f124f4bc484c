//! Session frames: the subset of frames a session multiplexes over its
//! connection channel

use fe2o3_amqp_types::performatives::{Attach, Begin, Detach, Disposition, End, Flow, Transfer};

use crate::Payload;

/// A frame as seen by a session: channel plus the session-level body
#[derive(Debug)]
pub(crate) struct SessionFrame {
    pub channel: u16,
    pub body: SessionFrameBody,
}

impl SessionFrame {
    pub fn new(channel: impl Into<u16>, body: SessionFrameBody) -> Self {
        Self {
            channel: channel.into(),
            body,
        }
    }
}

#[derive(Debug)]
pub(crate) enum SessionFrameBody {
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer {
        performative: Transfer,
        payload: Payload,
    },
    Disposition(Disposition),
    Detach(Detach),
    End(End),
}

pub(crate) type SessionIncomingItem = SessionFrame;
