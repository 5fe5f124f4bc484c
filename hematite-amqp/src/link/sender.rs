//! The sending half of a link

use std::sync::Arc;
use std::time::Duration;

use fe2o3_amqp_types::{
    definitions::{self, Role, SenderSettleMode},
    messaging::{
        message::__private::Serializable, Accepted, DeliveryState, IntoBody, Message, Outcome,
        Source, Target,
    },
    performatives::Transfer,
};
use serde_bytes::ByteBuf;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    control::SessionControl,
    session::SessionHandle,
    util::AsyncOperationQueue,
};

use super::{
    delivery::Sendable,
    relay::LinkRelay,
    state::LinkFlowState,
    AttachError, DetachError, Link, LinkFrame, LinkState, SendError,
};

pub(crate) const DEFAULT_LINK_BUFFER_SIZE: usize = 256;

/// The sending half of a link.
///
/// A sender consumes link credit granted by the receiving peer and observes
/// the outcome of every unsettled delivery.
///
/// # Attach a sender with the default configuration
///
/// ```rust,ignore
/// let mut sender = Sender::attach(&mut session, "sender-1", "q1").await?;
/// let outcome = sender.send("hello").await?;
/// ```
#[derive(Debug)]
pub struct Sender {
    pub(crate) link: Link,
    pub(crate) output_handle: u32,
    pub(crate) outgoing: mpsc::Sender<LinkFrame>,
    pub(crate) incoming: mpsc::Receiver<LinkFrame>,
    pub(crate) session_control: mpsc::Sender<SessionControl>,
    pub(crate) flow_state: Arc<LinkFlowState>,
}

impl Sender {
    /// Creates a builder for a [`Sender`]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Attaches a sender on the session with the default configuration
    pub async fn attach<R>(
        session: &mut SessionHandle<R>,
        name: impl Into<String>,
        target: impl Into<Target>,
    ) -> Result<Sender, AttachError> {
        Self::builder()
            .name(name)
            .target(target)
            .attach(session)
            .await
    }

    /// The underlying link; clones share state with this sender's link
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// The current link credit granted by the receiving peer
    pub fn link_credit(&self) -> u32 {
        self.flow_state.link_credit()
    }

    /// Sends a message and waits for the delivery outcome.
    ///
    /// Waits for link credit first when none is available. A transfer that
    /// is sent settled (per the negotiated sender settle mode) resolves
    /// immediately with an accepted outcome.
    pub async fn send<T: IntoBody>(
        &mut self,
        message: impl Into<Message<T>>,
    ) -> Result<Outcome, SendError> {
        self.send_sendable(Sendable::from(message.into())).await
    }

    /// Sends a message with explicit transfer settings
    pub async fn send_sendable<T: IntoBody>(
        &mut self,
        sendable: Sendable<T>,
    ) -> Result<Outcome, SendError> {
        match self.link.state() {
            LinkState::Attached => {}
            _ => return Err(SendError::IllegalState),
        }

        let Sendable {
            message,
            message_format,
            settled,
        } = sendable;

        let message = message.map_body(IntoBody::into_body);
        let payload = serde_amqp::to_vec(&Serializable(message))?;
        let payload = crate::Payload::from(payload);

        // Waits until the receiving peer has granted credit
        let tag = self.flow_state.consume_credit_as_sender(1).await;

        let settled = match self.link.sender_settle_mode() {
            SenderSettleMode::Settled => true,
            SenderSettleMode::Unsettled => false,
            SenderSettleMode::Mixed => settled.unwrap_or(false),
        };

        let performative = Transfer {
            handle: self.output_handle.into(),
            // the delivery id is assigned by the session
            delivery_id: None,
            delivery_tag: Some(ByteBuf::from(tag.to_vec())),
            message_format: Some(message_format),
            settled: Some(settled),
            more: false,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        };

        let completion = match settled {
            true => None,
            false => Some(Arc::new(AsyncOperationQueue::<DeliveryState>::new())),
        };

        self.outgoing
            .send(LinkFrame::Transfer {
                performative,
                payload,
                completion: completion.clone(),
            })
            .await
            .map_err(|_| SendError::IllegalSessionState)?;

        match completion {
            None => Ok(Outcome::Accepted(Accepted {})),
            Some(queue) => {
                let state = queue
                    .wait_until(None)
                    .await
                    .ok_or(SendError::IllegalSessionState)?;
                match state {
                    DeliveryState::Accepted(accepted) => Ok(Outcome::Accepted(accepted)),
                    DeliveryState::Rejected(rejected) => Ok(Outcome::Rejected(rejected)),
                    DeliveryState::Released(released) => Ok(Outcome::Released(released)),
                    DeliveryState::Modified(modified) => Ok(Outcome::Modified(modified)),
                    // the session only completes terminal outcomes
                    _ => Err(SendError::IllegalState),
                }
            }
        }
    }

    /// Sends a message, giving up when the outcome does not arrive within
    /// the timeout. A late outcome is discarded silently.
    pub async fn send_with_timeout<T: IntoBody>(
        &mut self,
        message: impl Into<Message<T>>,
        timeout: Duration,
    ) -> Result<Outcome, SendError> {
        match tokio::time::timeout(timeout, self.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Detaches the sender without closing the link
    pub async fn detach(mut self) -> Result<DetachedSender, DetachError> {
        self.detach_inner(false).await?;
        Ok(DetachedSender { link: self.link })
    }

    /// Closes the link
    pub async fn close(mut self) -> Result<(), DetachError> {
        self.detach_inner(true).await
    }

    async fn detach_inner(&mut self, closed: bool) -> Result<(), DetachError> {
        let detach = fe2o3_amqp_types::performatives::Detach {
            handle: self.output_handle.into(),
            closed,
            error: None,
        };
        self.link.set_state(match closed {
            true => LinkState::CloseSent,
            false => LinkState::DetachSent,
        });
        self.outgoing
            .send(LinkFrame::Detach(detach))
            .await
            .map_err(|_| DetachError::IllegalSessionState)?;

        let remote_detach = loop {
            match self.incoming.recv().await {
                Some(LinkFrame::Detach(detach)) => break detach,
                // In-flight frames that raced the detach are dropped
                Some(frame) => debug!(?frame, "Frame dropped while awaiting detach"),
                None => return Err(DetachError::IllegalSessionState),
            }
        };

        let _ = self
            .session_control
            .send(SessionControl::DeallocateLink(self.link.name().to_string()))
            .await;

        self.link.set_state(match closed {
            true => LinkState::Closed,
            false => LinkState::Detached,
        });

        if let Some(error) = remote_detach.error {
            return Err(DetachError::RemoteDetachedWithError(error));
        }
        match (closed, remote_detach.closed) {
            (true, false) => Err(DetachError::DetachedByRemote),
            (false, true) => Err(DetachError::ClosedByRemote),
            _ => Ok(()),
        }
    }
}

/// A sender whose link was detached without closing; the link can be
/// re-attached on a session
#[derive(Debug)]
pub struct DetachedSender {
    link: Link,
}

impl DetachedSender {
    /// The detached link
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Re-attaches the link on a session
    pub async fn resume<R>(self, session: &mut SessionHandle<R>) -> Result<Sender, AttachError> {
        Builder::new().link(self.link).attach(session).await
    }
}

/// Builder for a [`Sender`]
#[derive(Debug, Default)]
pub struct Builder {
    /// The name of the link
    pub name: String,

    /// The source of the link; defaults to an empty source
    pub source: Option<Source>,

    /// The target of the link
    pub target: Option<Target>,

    /// The sender settle mode
    pub sender_settle_mode: Option<SenderSettleMode>,

    /// The max message size announced in the attach frame
    pub max_message_size: Option<u64>,

    /// The initial delivery count announced in the attach frame
    pub initial_delivery_count: Option<u32>,

    /// Attach properties
    pub properties: Option<definitions::Fields>,

    /// An existing link to attach instead of building a new one
    pub link: Option<Link>,

    /// Buffer size for frames routed to this link
    pub buffer_size: Option<usize>,
}

impl Builder {
    /// Creates a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name of the link
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the source of the link
    pub fn source(mut self, source: impl Into<Source>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the target of the link
    pub fn target(mut self, target: impl Into<Target>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Sets the sender settle mode
    pub fn sender_settle_mode(mut self, mode: SenderSettleMode) -> Self {
        self.sender_settle_mode = Some(mode);
        self
    }

    /// Sets the max message size
    pub fn max_message_size(mut self, size: u64) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Sets the initial delivery count
    pub fn initial_delivery_count(mut self, count: u32) -> Self {
        self.initial_delivery_count = Some(count);
        self
    }

    /// Sets the attach properties
    pub fn properties(mut self, properties: definitions::Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Attaches an existing link instead of building a new one
    pub fn link(mut self, link: Link) -> Self {
        self.link = Some(link);
        self
    }

    /// Attaches the sender on the session.
    ///
    /// Sends an Attach and waits for the peer's answering Attach; a Detach
    /// in response means the peer refused the link.
    pub async fn attach<R>(self, session: &mut SessionHandle<R>) -> Result<Sender, AttachError> {
        let link = match self.link {
            Some(link) => {
                if link.role() != Role::Sender {
                    return Err(AttachError::RoleMismatch);
                }
                link
            }
            None => {
                let link = Link::new(
                    self.name,
                    Role::Sender,
                    Some(self.source.unwrap_or_default()),
                    self.target,
                );
                if let Some(mode) = self.sender_settle_mode {
                    link.set_sender_settle_mode(mode)
                        .map_err(|_| AttachError::IllegalState)?;
                }
                if let Some(size) = self.max_message_size {
                    link.set_max_message_size(size)
                        .map_err(|_| AttachError::IllegalState)?;
                }
                if let Some(count) = self.initial_delivery_count {
                    link.set_initial_delivery_count(count)
                        .map_err(|_| AttachError::IllegalState)?;
                }
                if let Some(properties) = self.properties {
                    link.set_attach_properties(properties)
                        .map_err(|_| AttachError::IllegalState)?;
                }
                link
            }
        };

        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_LINK_BUFFER_SIZE);
        let flow_state = Arc::new(LinkFlowState::new(link.initial_delivery_count()));
        let (tx, incoming) = mpsc::channel(buffer_size);
        let relay = LinkRelay::sender(tx, flow_state.clone());

        let output_handle = session
            .allocate_link(link.name().to_string(), relay)
            .await?;

        let mut sender = Sender {
            link,
            output_handle,
            outgoing: session.outgoing.clone(),
            incoming,
            session_control: session.control.clone(),
            flow_state,
        };

        let attach = sender.link.local_attach(output_handle);
        sender.link.set_state(LinkState::AttachSent);
        sender
            .outgoing
            .send(LinkFrame::Attach(attach))
            .await
            .map_err(|_| AttachError::IllegalSessionState)?;

        match sender.incoming.recv().await {
            Some(LinkFrame::Attach(remote)) => {
                sender.link.on_remote_attach(&remote);
                Ok(sender)
            }
            Some(LinkFrame::Detach(detach)) => {
                // The peer refused the attach; answer its closing detach
                let reply = fe2o3_amqp_types::performatives::Detach {
                    handle: output_handle.into(),
                    closed: true,
                    error: None,
                };
                let _ = sender.outgoing.send(LinkFrame::Detach(reply)).await;
                let _ = sender
                    .session_control
                    .send(SessionControl::DeallocateLink(
                        sender.link.name().to_string(),
                    ))
                    .await;
                Err(AttachError::RefusedByRemote(detach.error))
            }
            Some(_) => Err(AttachError::IllegalState),
            None => Err(AttachError::IllegalSessionState),
        }
    }
}
