//! The receiving half of a link

use std::sync::Arc;

use bytes::Buf;
use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, ReceiverSettleMode, Role},
    messaging::{
        message::__private::Deserializable, Accepted, DeliveryState, FromBody, Message, Modified,
        Rejected, Released, Source, Target,
    },
    performatives::{Disposition, Flow},
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{control::SessionControl, session::SessionHandle};

use super::{
    delivery::Delivery,
    relay::LinkRelay,
    state::LinkFlowState,
    sender::DEFAULT_LINK_BUFFER_SIZE,
    AttachError, CreditMode, DetachError, DispositionError, Link, LinkFrame, LinkState, RecvError,
};

/// The receiving half of a link.
///
/// A receiver grants link credit to the sending peer and surfaces each
/// inbound delivery. In the default configuration credit is replenished
/// automatically and deliveries still have to be explicitly accepted (or
/// otherwise disposed); with `auto_accept` an accepted disposition is
/// returned for every delivery as it is received.
///
/// # Attach a receiver with the default configuration
///
/// ```rust,ignore
/// let mut receiver = Receiver::attach(&mut session, "receiver-1", "q1").await?;
/// let delivery: Delivery<String> = receiver.recv().await?;
/// receiver.accept(&delivery).await?;
/// ```
#[derive(Debug)]
pub struct Receiver {
    pub(crate) link: Link,
    pub(crate) output_handle: u32,
    pub(crate) outgoing: mpsc::Sender<LinkFrame>,
    pub(crate) incoming: mpsc::Receiver<LinkFrame>,
    pub(crate) session_control: mpsc::Sender<SessionControl>,
    pub(crate) flow_state: Arc<LinkFlowState>,
    pub(crate) credit_mode: CreditMode,
    pub(crate) auto_accept: bool,
}

impl Receiver {
    /// Creates a builder for a [`Receiver`]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Attaches a receiver on the session with the default configuration
    pub async fn attach<R>(
        session: &mut SessionHandle<R>,
        name: impl Into<String>,
        source: impl Into<Source>,
    ) -> Result<Receiver, AttachError> {
        Self::builder()
            .name(name)
            .source(source)
            .attach(session)
            .await
    }

    /// The underlying link; clones share state with this receiver's link
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Receives the next delivery.
    ///
    /// Replenishes link credit per the configured credit mode, and sends an
    /// accepted disposition right away when `auto_accept` is enabled.
    pub async fn recv<T>(&mut self) -> Result<Delivery<T>, RecvError>
    where
        for<'de> T: FromBody<'de> + Send,
    {
        loop {
            let frame = match self.incoming.recv().await {
                Some(frame) => frame,
                None => return Err(RecvError::IllegalSessionState),
            };

            match frame {
                LinkFrame::Transfer {
                    performative,
                    payload,
                    ..
                } => {
                    let delivery_id = performative.delivery_id.ok_or(RecvError::IllegalState)?;
                    let delivery_tag = performative
                        .delivery_tag
                        .clone()
                        .ok_or(RecvError::IllegalState)?;
                    let settled = performative.settled.unwrap_or(false);

                    let message: Deserializable<Message<T>> =
                        serde_amqp::from_reader(payload.reader())?;
                    let delivery = Delivery {
                        delivery_id,
                        delivery_tag,
                        message: message.0,
                    };

                    if self.auto_accept && !settled {
                        self.dispose(delivery_id, true, DeliveryState::Accepted(Accepted {}))
                            .await
                            .map_err(|_| RecvError::IllegalSessionState)?;
                    }

                    self.replenish_credit().await?;

                    return Ok(delivery);
                }
                LinkFrame::Detach(detach) => {
                    let error = detach.error.clone();
                    self.on_remote_detach(detach).await;
                    return Err(RecvError::RemoteDetached(error));
                }
                frame => debug!(?frame, "Frame dropped while awaiting a delivery"),
            }
        }
    }

    /// Grants the sender the given amount of link credit
    pub async fn set_credit(&mut self, credit: u32) -> Result<(), DispositionError> {
        self.flow_state.set_link_credit(credit);
        let flow = Flow {
            // session level fields are patched in by the session
            next_incoming_id: None,
            incoming_window: 0,
            next_outgoing_id: 0,
            outgoing_window: 0,
            handle: Some(self.output_handle.into()),
            delivery_count: Some(self.flow_state.delivery_count()),
            link_credit: Some(credit),
            available: None,
            drain: false,
            echo: false,
            properties: None,
        };
        self.outgoing
            .send(LinkFrame::Flow(flow))
            .await
            .map_err(|_| DispositionError::IllegalSessionState)
    }

    /// Asks the sender to consume or return all outstanding link credit
    pub async fn drain(&mut self) -> Result<(), DispositionError> {
        let flow = Flow {
            next_incoming_id: None,
            incoming_window: 0,
            next_outgoing_id: 0,
            outgoing_window: 0,
            handle: Some(self.output_handle.into()),
            delivery_count: Some(self.flow_state.delivery_count()),
            link_credit: Some(self.flow_state.link_credit()),
            available: None,
            drain: true,
            echo: false,
            properties: None,
        };
        self.outgoing
            .send(LinkFrame::Flow(flow))
            .await
            .map_err(|_| DispositionError::IllegalSessionState)
    }

    /// Accepts a delivery
    pub async fn accept<T>(&mut self, delivery: &Delivery<T>) -> Result<(), DispositionError> {
        self.dispose(
            delivery.delivery_id,
            true,
            DeliveryState::Accepted(Accepted {}),
        )
        .await
    }

    /// Rejects a delivery
    pub async fn reject<T>(
        &mut self,
        delivery: &Delivery<T>,
        error: impl Into<Option<definitions::Error>>,
    ) -> Result<(), DispositionError> {
        self.dispose(
            delivery.delivery_id,
            true,
            DeliveryState::Rejected(Rejected {
                error: error.into(),
            }),
        )
        .await
    }

    /// Releases a delivery
    pub async fn release<T>(&mut self, delivery: &Delivery<T>) -> Result<(), DispositionError> {
        self.dispose(
            delivery.delivery_id,
            true,
            DeliveryState::Released(Released {}),
        )
        .await
    }

    /// Modifies a delivery
    pub async fn modify<T>(
        &mut self,
        delivery: &Delivery<T>,
        modified: Modified,
    ) -> Result<(), DispositionError> {
        self.dispose(delivery.delivery_id, true, DeliveryState::Modified(modified))
            .await
    }

    async fn dispose(
        &mut self,
        delivery_id: DeliveryNumber,
        settled: bool,
        state: DeliveryState,
    ) -> Result<(), DispositionError> {
        // In receiver-settle-mode First the disposition is sent settled;
        // mode Second would leave it unsettled until the sender confirms
        let settled = match self.link.receiver_settle_mode() {
            ReceiverSettleMode::First => settled,
            ReceiverSettleMode::Second => false,
        };
        let disposition = Disposition {
            role: Role::Receiver,
            first: delivery_id,
            last: None,
            settled,
            state: Some(state),
            batchable: false,
        };
        self.outgoing
            .send(LinkFrame::Disposition(disposition))
            .await
            .map_err(|_| DispositionError::IllegalSessionState)
    }

    async fn replenish_credit(&mut self) -> Result<(), RecvError> {
        if let CreditMode::Auto(max_credit) = self.credit_mode {
            if self.flow_state.link_credit() < max_credit / 2 {
                self.set_credit(max_credit)
                    .await
                    .map_err(|_| RecvError::IllegalSessionState)?;
            }
        }
        Ok(())
    }

    async fn on_remote_detach(&mut self, detach: fe2o3_amqp_types::performatives::Detach) {
        self.link.set_state(match detach.closed {
            true => LinkState::CloseReceived,
            false => LinkState::DetachReceived,
        });
        let reply = fe2o3_amqp_types::performatives::Detach {
            handle: self.output_handle.into(),
            closed: detach.closed,
            error: None,
        };
        let _ = self.outgoing.send(LinkFrame::Detach(reply)).await;
        let _ = self
            .session_control
            .send(SessionControl::DeallocateLink(self.link.name().to_string()))
            .await;
        self.link.set_state(match detach.closed {
            true => LinkState::Closed,
            false => LinkState::Detached,
        });
    }

    /// Detaches the receiver without closing the link
    pub async fn detach(mut self) -> Result<DetachedReceiver, DetachError> {
        self.detach_inner(false).await?;
        Ok(DetachedReceiver { link: self.link })
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
                // Deliveries that raced the detach are dropped; the peer
                // will resend anything left unsettled
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

/// A receiver whose link was detached without closing; the link can be
/// re-attached on a session
#[derive(Debug)]
pub struct DetachedReceiver {
    link: Link,
}

impl DetachedReceiver {
    /// The detached link
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Re-attaches the link on a session
    pub async fn resume<R>(self, session: &mut SessionHandle<R>) -> Result<Receiver, AttachError> {
        Builder::new().link(self.link).attach(session).await
    }
}

/// Builder for a [`Receiver`]
#[derive(Debug, Default)]
pub struct Builder {
    /// The name of the link
    pub name: String,

    /// The source of the link
    pub source: Option<Source>,

    /// The target of the link; defaults to an empty target
    pub target: Option<Target>,

    /// The receiver settle mode
    pub receiver_settle_mode: Option<ReceiverSettleMode>,

    /// Attach properties
    pub properties: Option<definitions::Fields>,

    /// Credit management mode; defaults to automatic replenishment
    pub credit_mode: Option<CreditMode>,

    /// Whether deliveries are accepted as they are received
    pub auto_accept: bool,

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

    /// Sets the receiver settle mode
    pub fn receiver_settle_mode(mut self, mode: ReceiverSettleMode) -> Self {
        self.receiver_settle_mode = Some(mode);
        self
    }

    /// Sets the attach properties
    pub fn properties(mut self, properties: definitions::Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Sets the credit mode
    pub fn credit_mode(mut self, credit_mode: CreditMode) -> Self {
        self.credit_mode = Some(credit_mode);
        self
    }

    /// Sets whether deliveries are accepted as they are received
    pub fn auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }

    /// Attaches an existing link instead of building a new one
    pub fn link(mut self, link: Link) -> Self {
        self.link = Some(link);
        self
    }

    /// Attaches the receiver on the session.
    ///
    /// Sends an Attach and waits for the peer's answering Attach; in auto
    /// credit mode the initial credit is granted right after the handshake.
    pub async fn attach<R>(self, session: &mut SessionHandle<R>) -> Result<Receiver, AttachError> {
        let link = match self.link {
            Some(link) => {
                if link.role() != Role::Receiver {
                    return Err(AttachError::RoleMismatch);
                }
                link
            }
            None => {
                let link = Link::new(
                    self.name,
                    Role::Receiver,
                    self.source,
                    Some(self.target.unwrap_or_default()),
                );
                if let Some(mode) = self.receiver_settle_mode {
                    link.set_receiver_settle_mode(mode)
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
        let flow_state = Arc::new(LinkFlowState::new(0));
        let (tx, incoming) = mpsc::channel(buffer_size);
        let relay = LinkRelay::receiver(tx, flow_state.clone());

        let output_handle = session
            .allocate_link(link.name().to_string(), relay)
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

        let attach = receiver.link.local_attach(output_handle);
        receiver.link.set_state(LinkState::AttachSent);
        receiver
            .outgoing
            .send(LinkFrame::Attach(attach))
            .await
            .map_err(|_| AttachError::IllegalSessionState)?;

        match receiver.incoming.recv().await {
            Some(LinkFrame::Attach(remote)) => {
                // The receiver tracks the sender's delivery count from the
                // value announced in the remote attach
                receiver
                    .flow_state
                    .set_delivery_count(remote.initial_delivery_count.unwrap_or(0));
                receiver.link.on_remote_attach(&remote);
            }
            Some(LinkFrame::Detach(detach)) => {
                let reply = fe2o3_amqp_types::performatives::Detach {
                    handle: output_handle.into(),
                    closed: true,
                    error: None,
                };
                let _ = receiver.outgoing.send(LinkFrame::Detach(reply)).await;
                let _ = receiver
                    .session_control
                    .send(SessionControl::DeallocateLink(
                        receiver.link.name().to_string(),
                    ))
                    .await;
                return Err(AttachError::RefusedByRemote(detach.error));
            }
            Some(_) => return Err(AttachError::IllegalState),
            None => return Err(AttachError::IllegalSessionState),
        }

        if let CreditMode::Auto(credit) = receiver.credit_mode {
            receiver
                .set_credit(credit)
                .await
                .map_err(|_| AttachError::IllegalSessionState)?;
        }

        Ok(receiver)
    }
}
