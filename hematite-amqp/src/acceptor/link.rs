//! Listener side link acceptor

use std::sync::Arc;

use fe2o3_amqp_types::{
    definitions::Role,
    messaging::TargetArchetype,
    performatives::Attach,
};
use tokio::sync::mpsc;

use crate::{
    link::{
        receiver::Receiver,
        relay::LinkRelay,
        sender::{Sender, DEFAULT_LINK_BUFFER_SIZE},
        state::LinkFlowState,
        AttachError, CreditMode, Link, LinkFrame,
    },
    session::error::AllocLinkError,
};

use super::session::ListenerSessionHandle;

/// A remotely initiated link attach offered to the listener.
///
/// Passing the endpoint to a [`LinkAcceptor`] builds the complementary
/// local endpoint: a peer attaching as sender is answered with a local
/// receiver and vice versa.
#[derive(Debug)]
pub struct LinkEndpoint {
    pub(crate) attach: Attach,
}

impl LinkEndpoint {
    pub(crate) fn new(attach: Attach) -> Self {
        Self { attach }
    }

    /// The name of the link the peer wants to attach
    pub fn name(&self) -> &str {
        &self.attach.name
    }

    /// The role the peer attaches with
    pub fn role(&self) -> &Role {
        &self.attach.role
    }

    /// The Attach performative the peer sent
    pub fn attach(&self) -> &Attach {
        &self.attach
    }
}

/// The local endpoint built for an accepted incoming attach
#[derive(Debug)]
pub enum AcceptedLink {
    /// The peer attached as receiver; the local endpoint sends
    Sender(Sender),

    /// The peer attached as sender; the local endpoint receives
    Receiver(Receiver),
}

/// Accepts remotely initiated links.
#[derive(Debug, Clone, Default)]
pub struct LinkAcceptor {
    /// Credit mode for accepted receiving endpoints
    pub credit_mode: Option<CreditMode>,

    /// Whether accepted receiving endpoints auto accept deliveries
    pub auto_accept: bool,
}

impl LinkAcceptor {
    /// Creates a link acceptor with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts an incoming attach, answering with the complementary local
    /// endpoint
    pub async fn accept(
        &self,
        endpoint: LinkEndpoint,
        session: &mut ListenerSessionHandle,
    ) -> Result<AcceptedLink, AttachError> {
        let LinkEndpoint { attach } = endpoint;

        // The local role is the reverse of the peer's
        match attach.role {
            Role::Sender => self.accept_as_receiver(attach, session).await.map(AcceptedLink::Receiver),
            Role::Receiver => self.accept_as_sender(attach, session).await.map(AcceptedLink::Sender),
        }
    }

    async fn accept_as_receiver(
        &self,
        remote_attach: Attach,
        session: &mut ListenerSessionHandle,
    ) -> Result<Receiver, AttachError> {
        let link = Link::new(
            remote_attach.name.clone(),
            Role::Receiver,
            remote_attach.source.clone().map(|s| *s),
            remote_attach
                .target
                .clone()
                .map(|t| match *t {
                    TargetArchetype::Target(target) => target,
                }),
        );
        // Honor the settle modes the peer requested
        link.set_sender_settle_mode(remote_attach.snd_settle_mode.clone())
            .map_err(|_| AttachError::IllegalState)?;
        link.set_receiver_settle_mode(remote_attach.rcv_settle_mode.clone())
            .map_err(|_| AttachError::IllegalState)?;

        let flow_state = Arc::new(LinkFlowState::new(0));
        flow_state.set_delivery_count(remote_attach.initial_delivery_count.unwrap_or(0));
        let (tx, incoming) = mpsc::channel(DEFAULT_LINK_BUFFER_SIZE);
        let relay = LinkRelay::receiver(tx, flow_state.clone());

        let output_handle =
            allocate_incoming_link(session, link.name().to_string(), relay, remote_attach.handle.0)
                .await?;

        let mut receiver = Receiver {
            link,
            output_handle,
            outgoing: session.outgoing.clone(),
            incoming,
            session_control: session.control.clone(),
            flow_state,
            credit_mode: self.credit_mode.unwrap_or_default(),
            auto_accept: self.auto_accept,
        };

        let local_attach = receiver.link.local_attach(output_handle);
        receiver
            .outgoing
            .send(LinkFrame::Attach(local_attach))
            .await
            .map_err(|_| AttachError::IllegalSessionState)?;

        receiver.link.on_remote_attach(&remote_attach);

        if let CreditMode::Auto(credit) = receiver.credit_mode {
            receiver
                .set_credit(credit)
                .await
                .map_err(|_| AttachError::IllegalSessionState)?;
        }

        Ok(receiver)
    }

    async fn accept_as_sender(
        &self,
        remote_attach: Attach,
        session: &mut ListenerSessionHandle,
    ) -> Result<Sender, AttachError> {
        let link = Link::new(
            remote_attach.name.clone(),
            Role::Sender,
            remote_attach.source.clone().map(|s| *s),
            remote_attach
                .target
                .clone()
                .map(|t| match *t {
                    TargetArchetype::Target(target) => target,
                }),
        );
        link.set_sender_settle_mode(remote_attach.snd_settle_mode.clone())
            .map_err(|_| AttachError::IllegalState)?;
        link.set_receiver_settle_mode(remote_attach.rcv_settle_mode.clone())
            .map_err(|_| AttachError::IllegalState)?;

        let flow_state = Arc::new(LinkFlowState::new(link.initial_delivery_count()));
        let (tx, incoming) = mpsc::channel(DEFAULT_LINK_BUFFER_SIZE);
        let relay = LinkRelay::sender(tx, flow_state.clone());

        let output_handle =
            allocate_incoming_link(session, link.name().to_string(), relay, remote_attach.handle.0)
                .await?;

        let sender = Sender {
            link,
            output_handle,
            outgoing: session.outgoing.clone(),
            incoming,
            session_control: session.control.clone(),
            flow_state,
        };

        let local_attach = sender.link.local_attach(output_handle);
        sender
            .outgoing
            .send(LinkFrame::Attach(local_attach))
            .await
            .map_err(|_| AttachError::IllegalSessionState)?;

        sender.link.on_remote_attach(&remote_attach);

        Ok(sender)
    }
}

async fn allocate_incoming_link(
    session: &mut ListenerSessionHandle,
    link_name: String,
    link_relay: LinkRelay,
    input_handle: u32,
) -> Result<u32, AttachError> {
    let (responder, resp_rx) = tokio::sync::oneshot::channel();
    session
        .control
        .send(crate::control::SessionControl::AllocateIncomingLink {
            link_name,
            link_relay,
            input_handle,
            responder,
        })
        .await
        .map_err(|_| AllocLinkError::IllegalSessionState)?;
    let handle = resp_rx
        .await
        .map_err(|_| AllocLinkError::IllegalSessionState)??;
    Ok(handle)
}
