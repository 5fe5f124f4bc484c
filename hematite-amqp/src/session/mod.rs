//! Implements the AMQP 1.0 session

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, Handle, SequenceNo, TransferNumber},
    messaging::DeliveryState,
    performatives::{Attach, Begin, Detach, Disposition, End, Flow, Transfer},
    primitives::Uint as UInt,
};
use slab::Slab;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{instrument, trace};

use crate::{
    connection::ConnectionHandle,
    control::SessionControl,
    link::{relay::LinkRelay, LinkFrame},
    util::AsyncOperationQueue,
    Payload,
};

pub(crate) mod frame;
use frame::{SessionFrame, SessionFrameBody};

pub mod builder;
pub(crate) mod engine;
pub mod error;
pub use error::{BeginError, Error};

/// Default incoming window
pub const DEFAULT_WINDOW: UInt = 2048;

/// Session states as defined in the AMQP 1.0 specification Part 2.5.5
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// UNMAPPED
    Unmapped,

    /// BEGIN SENT
    BeginSent,

    /// BEGIN RCVD
    BeginReceived,

    /// MAPPED
    Mapped,

    /// END SENT
    EndSent,

    /// END RCVD
    EndReceived,

    /// DISCARDING
    Discarding,
}

/// A handle to the session event loop.
///
/// `R` is `()` for client sessions and holds the incoming-link listener on
/// the listener side.
#[derive(Debug)]
pub struct SessionHandle<R> {
    pub(crate) control: mpsc::Sender<SessionControl>,
    pub(crate) engine_handle: Option<JoinHandle<Result<(), Error>>>,

    // Cloned into every link attached on this session
    pub(crate) outgoing: mpsc::Sender<LinkFrame>,
    pub(crate) link_listener: R,
}

impl<R> SessionHandle<R> {
    /// Checks whether the underlying event loop has stopped
    pub fn is_ended(&self) -> bool {
        self.control.is_closed() || self.engine_handle.is_none()
    }

    /// Ends the session.
    ///
    /// Ending a session that already ended through this handle fails with
    /// [`Error::IllegalState`].
    pub async fn end(&mut self) -> Result<(), Error> {
        // If sending fails the event loop has already stopped; the outcome
        // is then reported by `on_end`.
        let _ = self.control.send(SessionControl::End(None)).await;
        self.on_end().await
    }

    /// Ends the session with an error
    pub async fn end_with_error(
        &mut self,
        error: impl Into<definitions::Error>,
    ) -> Result<(), Error> {
        let _ = self
            .control
            .send(SessionControl::End(Some(error.into())))
            .await;
        self.on_end().await
    }

    /// Returns when the underlying event loop has stopped
    pub async fn on_end(&mut self) -> Result<(), Error> {
        match self.engine_handle.take() {
            Some(handle) => match handle.await {
                Ok(res) => res,
                Err(_) => Err(Error::JoinError),
            },
            None => Err(Error::IllegalState),
        }
    }

    pub(crate) async fn allocate_link(
        &mut self,
        link_name: String,
        link_relay: LinkRelay,
    ) -> Result<u32, error::AllocLinkError> {
        let (responder, resp_rx) = oneshot::channel();
        self.control
            .send(SessionControl::AllocateLink {
                link_name,
                link_relay,
                responder,
            })
            .await
            .map_err(|_| error::AllocLinkError::IllegalSessionState)?;
        resp_rx
            .await
            .map_err(|_| error::AllocLinkError::IllegalSessionState)?
    }
}

/// An AMQP 1.0 session endpoint.
///
/// Holds the session state machine, the transfer-number windows, and the
/// handle-to-link routing tables. Owned and driven exclusively by the
/// session event loop; user facing operations go through [`SessionHandle`].
///
/// # Begin a session with the default configuration
///
/// ```rust,ignore
/// let session = Session::begin(&mut connection).await?;
/// ```
#[derive(Debug)]
pub struct Session {
    outgoing_channel: u16,

    // local amqp states
    local_state: SessionState,
    next_outgoing_id: TransferNumber,
    incoming_window: UInt,
    outgoing_window: UInt,
    handle_max: Handle,

    // remote amqp states
    incoming_channel: Option<u16>,
    next_incoming_id: TransferNumber,
    remote_incoming_window: SequenceNo,
    remote_outgoing_window: SequenceNo,

    // local links
    link_relays: Slab<LinkRelay>,
    link_by_name: HashMap<String, usize>,
    link_by_input_handle: HashMap<u32, usize>,

    // outgoing unsettled deliveries awaiting a disposition
    delivery_completions: BTreeMap<DeliveryNumber, Arc<AsyncOperationQueue<DeliveryState>>>,
}

impl Session {
    /// Creates a builder for a [`Session`]
    pub fn builder() -> builder::Builder {
        builder::Builder::new()
    }

    /// Begins a session on the connection with the default configuration
    pub async fn begin(
        connection: &mut ConnectionHandle<()>,
    ) -> Result<SessionHandle<()>, BeginError> {
        Session::builder().begin(connection).await
    }
}

/* ------------------------------- Private API ------------------------------ */

impl Session {
    pub(crate) fn new(outgoing_channel: u16, builder: &builder::Builder) -> Self {
        Self {
            outgoing_channel,
            local_state: SessionState::Unmapped,
            next_outgoing_id: builder.next_outgoing_id,
            incoming_window: builder.incoming_window,
            outgoing_window: builder.outgoing_window,
            handle_max: builder.handle_max.clone(),

            incoming_channel: None,
            next_incoming_id: 0,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,

            link_relays: Slab::new(),
            link_by_name: HashMap::new(),
            link_by_input_handle: HashMap::new(),

            delivery_completions: BTreeMap::new(),
        }
    }

    pub(crate) fn local_state(&self) -> &SessionState {
        &self.local_state
    }

    pub(crate) fn outgoing_channel(&self) -> u16 {
        self.outgoing_channel
    }

    pub(crate) fn allocate_link(
        &mut self,
        link_name: String,
        link_relay: LinkRelay,
    ) -> Result<u32, error::AllocLinkError> {
        match &self.local_state {
            SessionState::Mapped => {}
            _ => return Err(error::AllocLinkError::IllegalSessionState),
        };

        if self.link_by_name.contains_key(&link_name) {
            return Err(error::AllocLinkError::DuplicatedLinkName);
        }

        let entry = self.link_relays.vacant_entry();
        let handle = entry.key() as u32;

        if handle > self.handle_max.0 {
            return Err(error::AllocLinkError::HandleMaxReached);
        }

        entry.insert(link_relay);
        self.link_by_name.insert(link_name, handle as usize);
        Ok(handle)
    }

    pub(crate) fn allocate_incoming_link(
        &mut self,
        link_name: String,
        link_relay: LinkRelay,
        input_handle: u32,
    ) -> Result<u32, error::AllocLinkError> {
        let output_handle = self.allocate_link(link_name, link_relay)?;
        self.link_by_input_handle
            .insert(input_handle, output_handle as usize);
        Ok(output_handle)
    }

    pub(crate) fn deallocate_link(&mut self, link_name: &str) {
        if let Some(handle) = self.link_by_name.remove(link_name) {
            if self.link_relays.contains(handle) {
                self.link_relays.remove(handle);
            }
            self.link_by_input_handle.retain(|_, h| *h != handle);
        }
    }

    #[instrument(name = "RECV", skip_all)]
    pub(crate) fn on_incoming_begin(&mut self, channel: u16, begin: Begin) -> Result<(), Error> {
        trace!(channel, frame = ?begin);
        match self.local_state {
            SessionState::Unmapped => self.local_state = SessionState::BeginReceived,
            SessionState::BeginSent => self.local_state = SessionState::Mapped,
            _ => return Err(Error::IllegalState),
        }

        self.incoming_channel = Some(channel);
        self.next_incoming_id = begin.next_outgoing_id;
        self.remote_incoming_window = begin.incoming_window;
        self.remote_outgoing_window = begin.outgoing_window;

        Ok(())
    }

    /// Routes a remote Attach to the link that announced the same name.
    ///
    /// Returns the attach back to the caller when no local link matches;
    /// the listener side offers it as an incoming link endpoint.
    #[instrument(name = "RECV", skip_all)]
    pub(crate) async fn on_incoming_attach(
        &mut self,
        attach: Attach,
    ) -> Result<Option<Attach>, Error> {
        trace!(frame = ?attach);
        match self.link_by_name.get(&attach.name) {
            Some(handle) => {
                let input_handle = attach.handle.0;
                self.link_by_input_handle.insert(input_handle, *handle);
                let relay = self
                    .link_relays
                    .get_mut(*handle)
                    .ok_or(Error::UnattachedHandle(input_handle))?;
                relay
                    .forward(LinkFrame::Attach(attach))
                    .await
                    .map_err(|_| Error::UnattachedHandle(input_handle))?;
                Ok(None)
            }
            None => Ok(Some(attach)),
        }
    }

    #[instrument(name = "RECV", skip_all)]
    pub(crate) fn on_incoming_flow(&mut self, flow: Flow) -> Result<Option<SessionFrame>, Error> {
        trace!(frame = ?flow);

        // session flow state
        self.next_incoming_id = flow.next_outgoing_id;
        self.remote_incoming_window = flow.incoming_window;
        self.remote_outgoing_window = flow.outgoing_window;

        // link flow state
        if let Some(handle) = &flow.handle {
            let input_handle = handle.0;
            let relay_handle = *self
                .link_by_input_handle
                .get(&input_handle)
                .ok_or(Error::UnattachedHandle(input_handle))?;
            let relay = self
                .link_relays
                .get_mut(relay_handle)
                .ok_or(Error::UnattachedHandle(input_handle))?;
            if let Some(echo) = relay.on_incoming_flow(&flow, relay_handle as u32) {
                return Ok(Some(self.on_outgoing_flow(echo)));
            }
        } else if flow.echo {
            let echo = Flow {
                next_incoming_id: Some(self.next_incoming_id),
                incoming_window: self.incoming_window,
                next_outgoing_id: self.next_outgoing_id,
                outgoing_window: self.outgoing_window,
                handle: None,
                delivery_count: None,
                link_credit: None,
                available: None,
                drain: false,
                echo: false,
                properties: None,
            };
            return Ok(Some(SessionFrame::new(
                self.outgoing_channel,
                SessionFrameBody::Flow(echo),
            )));
        }

        Ok(None)
    }

    #[instrument(name = "RECV", skip_all)]
    pub(crate) async fn on_incoming_transfer(
        &mut self,
        transfer: Transfer,
        payload: Payload,
    ) -> Result<(), Error> {
        trace!(frame = ?transfer, payload_len = payload.len());

        // Every incoming transfer frame advances next-incoming-id
        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);

        let input_handle = transfer.handle.0;
        let relay_handle = *self
            .link_by_input_handle
            .get(&input_handle)
            .ok_or(Error::UnattachedHandle(input_handle))?;
        let relay = self
            .link_relays
            .get_mut(relay_handle)
            .ok_or(Error::UnattachedHandle(input_handle))?;

        relay.on_incoming_transfer(transfer, payload).await
    }

    /// Completes pending outgoing deliveries covered by the disposition
    #[instrument(name = "RECV", skip_all)]
    pub(crate) fn on_incoming_disposition(&mut self, disposition: Disposition) -> Result<(), Error> {
        trace!(frame = ?disposition);

        // Only dispositions from the receiving side settle outgoing
        // deliveries; sender side dispositions belong to settle mode
        // Second, which is not supported
        if !matches!(disposition.role, fe2o3_amqp_types::definitions::Role::Receiver) {
            return Ok(());
        }

        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);
        for delivery_id in first..=last {
            let is_terminal = matches!(
                disposition.state,
                Some(DeliveryState::Accepted(_))
                    | Some(DeliveryState::Rejected(_))
                    | Some(DeliveryState::Released(_))
                    | Some(DeliveryState::Modified(_))
            );
            if !is_terminal {
                continue;
            }
            if let Some(completion) = self.delivery_completions.remove(&delivery_id) {
                if let Some(state) = disposition.state.clone() {
                    completion.complete(state);
                }
            }
        }
        Ok(())
    }

    #[instrument(name = "RECV", skip_all)]
    pub(crate) async fn on_incoming_detach(&mut self, detach: Detach) -> Result<(), Error> {
        trace!(frame = ?detach);
        let input_handle = detach.handle.0;
        let relay_handle = *self
            .link_by_input_handle
            .get(&input_handle)
            .ok_or(Error::UnattachedHandle(input_handle))?;
        let relay = self
            .link_relays
            .get_mut(relay_handle)
            .ok_or(Error::UnattachedHandle(input_handle))?;
        relay
            .forward(LinkFrame::Detach(detach))
            .await
            .map_err(|_| Error::UnattachedHandle(input_handle))?;
        Ok(())
    }

    /// Returns the error the remote attached to its End, if any
    #[instrument(name = "RECV", skip_all)]
    pub(crate) fn on_incoming_end(
        &mut self,
        channel: u16,
        end: End,
    ) -> Result<Option<definitions::Error>, Error> {
        trace!(channel, frame = ?end);
        match self.local_state {
            SessionState::Mapped => self.local_state = SessionState::EndReceived,
            SessionState::Discarding | SessionState::EndSent => {
                self.local_state = SessionState::Unmapped
            }
            _ => return Err(Error::IllegalState),
        }

        Ok(end.error)
    }

    pub(crate) async fn send_begin(
        &mut self,
        writer: &mpsc::Sender<SessionFrame>,
    ) -> Result<(), BeginError> {
        let begin = Begin {
            remote_channel: self.incoming_channel,
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: self.incoming_window,
            outgoing_window: self.outgoing_window,
            handle_max: self.handle_max.clone(),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let frame = SessionFrame::new(self.outgoing_channel, SessionFrameBody::Begin(begin));

        match &self.local_state {
            SessionState::Unmapped => {
                writer
                    .send(frame)
                    .await
                    .map_err(|_| BeginError::IllegalConnectionState)?;
                self.local_state = SessionState::BeginSent;
            }
            SessionState::BeginReceived => {
                writer
                    .send(frame)
                    .await
                    .map_err(|_| BeginError::IllegalConnectionState)?;
                self.local_state = SessionState::Mapped;
            }
            _ => return Err(BeginError::IllegalState),
        }

        Ok(())
    }

    pub(crate) fn on_outgoing_attach(&mut self, attach: Attach) -> SessionFrame {
        SessionFrame::new(self.outgoing_channel, SessionFrameBody::Attach(attach))
    }

    /// Patches the session-level flow state into an outgoing Flow
    pub(crate) fn on_outgoing_flow(&mut self, mut flow: Flow) -> SessionFrame {
        flow.next_incoming_id = Some(self.next_incoming_id);
        flow.incoming_window = self.incoming_window;
        flow.next_outgoing_id = self.next_outgoing_id;
        flow.outgoing_window = self.outgoing_window;
        SessionFrame::new(self.outgoing_channel, SessionFrameBody::Flow(flow))
    }

    /// Assigns the delivery id and registers the completion of an outgoing
    /// transfer
    pub(crate) fn on_outgoing_transfer(
        &mut self,
        mut performative: Transfer,
        payload: Payload,
        completion: Option<Arc<AsyncOperationQueue<DeliveryState>>>,
    ) -> SessionFrame {
        let delivery_id = self.next_outgoing_id;
        self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        self.remote_incoming_window = self.remote_incoming_window.saturating_sub(1);

        performative.delivery_id = Some(delivery_id);
        if let Some(completion) = completion {
            self.delivery_completions.insert(delivery_id, completion);
        }

        SessionFrame::new(
            self.outgoing_channel,
            SessionFrameBody::Transfer {
                performative,
                payload,
            },
        )
    }

    pub(crate) fn on_outgoing_disposition(&mut self, disposition: Disposition) -> SessionFrame {
        SessionFrame::new(
            self.outgoing_channel,
            SessionFrameBody::Disposition(disposition),
        )
    }

    pub(crate) fn on_outgoing_detach(&mut self, detach: Detach) -> SessionFrame {
        SessionFrame::new(self.outgoing_channel, SessionFrameBody::Detach(detach))
    }

    pub(crate) async fn send_end(
        &mut self,
        writer: &mpsc::Sender<SessionFrame>,
        error: Option<definitions::Error>,
    ) -> Result<(), Error> {
        match self.local_state {
            SessionState::Mapped => match error.is_some() {
                true => self.local_state = SessionState::Discarding,
                false => self.local_state = SessionState::EndSent,
            },
            SessionState::EndReceived => self.local_state = SessionState::Unmapped,
            _ => return Err(Error::IllegalState),
        }

        let frame = SessionFrame::new(self.outgoing_channel, SessionFrameBody::End(End { error }));
        writer
            .send(frame)
            .await
            .map_err(|_| Error::IllegalConnectionState)?;
        Ok(())
    }
}
