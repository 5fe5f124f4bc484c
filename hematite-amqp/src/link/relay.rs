//! Per-link relays owned by the session event loop.
//!
//! The relay applies flow control and reassembles multi-frame deliveries in
//! the session task, and forwards attach/detach handshake frames and
//! complete deliveries to the link endpoint over its channel.

use std::sync::Arc;

use bytes::BytesMut;
use fe2o3_amqp_types::performatives::{Flow, Transfer};
use tokio::sync::mpsc;

use crate::{session::Error, Payload};

use super::{state::LinkFlowState, LinkFrame};

pub(crate) struct PartialDelivery {
    performative: Transfer,
    buffer: BytesMut,
}

pub(crate) enum LinkRelay {
    Sender {
        tx: mpsc::Sender<LinkFrame>,
        flow_state: Arc<LinkFlowState>,
    },
    Receiver {
        tx: mpsc::Sender<LinkFrame>,
        flow_state: Arc<LinkFlowState>,
        partial: Option<PartialDelivery>,
    },
}

impl std::fmt::Debug for LinkRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sender { .. } => f.debug_struct("LinkRelay::Sender").finish(),
            Self::Receiver { .. } => f.debug_struct("LinkRelay::Receiver").finish(),
        }
    }
}

impl LinkRelay {
    pub fn sender(tx: mpsc::Sender<LinkFrame>, flow_state: Arc<LinkFlowState>) -> Self {
        Self::Sender { tx, flow_state }
    }

    pub fn receiver(tx: mpsc::Sender<LinkFrame>, flow_state: Arc<LinkFlowState>) -> Self {
        Self::Receiver {
            tx,
            flow_state,
            partial: None,
        }
    }

    fn tx(&self) -> &mpsc::Sender<LinkFrame> {
        match self {
            Self::Sender { tx, .. } => tx,
            Self::Receiver { tx, .. } => tx,
        }
    }

    /// Forwards a handshake frame (attach or detach) to the link endpoint
    pub async fn forward(&mut self, frame: LinkFrame) -> Result<(), ()> {
        self.tx().send(frame).await.map_err(|_| ())
    }

    /// Applies an incoming Flow to the link flow state, returning the Flow
    /// to reply with if the peer requested one
    pub fn on_incoming_flow(&mut self, flow: &Flow, output_handle: u32) -> Option<Flow> {
        match self {
            Self::Sender { flow_state, .. } => {
                flow_state.on_incoming_flow_as_sender(flow, output_handle)
            }
            Self::Receiver { flow_state, .. } => {
                flow_state.on_incoming_flow_as_receiver(flow, output_handle)
            }
        }
    }

    /// Handles an incoming transfer on a receiver link.
    ///
    /// Consumes one link credit per delivery, buffers the payload while the
    /// `more` flag is set, and forwards the completed delivery to the
    /// receiver endpoint.
    pub async fn on_incoming_transfer(
        &mut self,
        transfer: Transfer,
        payload: Payload,
    ) -> Result<(), Error> {
        let (tx, flow_state, partial) = match self {
            Self::Receiver {
                tx,
                flow_state,
                partial,
            } => (tx, flow_state, partial),
            Self::Sender { .. } => {
                // A transfer sent to a sender link is a protocol violation
                return Err(Error::UnattachedHandle(transfer.handle.0));
            }
        };

        if transfer.aborted {
            *partial = None;
            return Ok(());
        }

        match partial.take() {
            Some(mut pending) => {
                pending.buffer.extend_from_slice(&payload);
                if transfer.more {
                    *partial = Some(pending);
                } else {
                    flow_state
                        .try_consume(1)
                        .map_err(|_| Error::TransferLimitExceeded)?;
                    let frame = LinkFrame::Transfer {
                        performative: pending.performative,
                        payload: pending.buffer.freeze(),
                        completion: None,
                    };
                    tx.send(frame)
                        .await
                        .map_err(|_| Error::UnattachedHandle(transfer.handle.0))?;
                }
            }
            None => {
                if transfer.more {
                    *partial = Some(PartialDelivery {
                        performative: transfer,
                        buffer: BytesMut::from(&payload[..]),
                    });
                } else {
                    flow_state
                        .try_consume(1)
                        .map_err(|_| Error::TransferLimitExceeded)?;
                    let input_handle = transfer.handle.0;
                    let frame = LinkFrame::Transfer {
                        performative: transfer,
                        payload,
                        completion: None,
                    };
                    tx.send(frame)
                        .await
                        .map_err(|_| Error::UnattachedHandle(input_handle))?;
                }
            }
        }

        Ok(())
    }
}
