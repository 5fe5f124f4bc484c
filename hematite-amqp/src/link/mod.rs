//! Implements AMQP 1.0 links: the shared link core, senders and receivers

use std::sync::Arc;

use fe2o3_amqp_types::{
    definitions::{Fields, ReceiverSettleMode, Role, SenderSettleMode, SequenceNo},
    messaging::{DeliveryState, Source, Target, TargetArchetype},
    performatives::{Attach, Disposition, Flow, Transfer},
};
use parking_lot::RwLock;

use crate::{util::AsyncOperationQueue, Payload};

pub mod delivery;
mod error;
pub mod receiver;
pub(crate) mod relay;
pub mod sender;
pub(crate) mod state;

pub use error::*;

/// Default credit granted by a receiver in auto credit mode
pub const DEFAULT_CREDIT: u32 = 100;

/// Link states.
///
/// There is no official definition of link states in the specification;
/// these mirror the attach/detach handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The initial state after initialization
    Unattached,

    /// An attach frame has been sent
    AttachSent,

    /// An attach frame has been received
    AttachReceived,

    /// The attach frames have been exchanged in both directions
    Attached,

    /// A detach frame has been sent
    DetachSent,

    /// A detach frame has been received
    DetachReceived,

    /// The detach frames have been exchanged in both directions
    Detached,

    /// A closing detach has been sent
    CloseSent,

    /// A closing detach has been received
    CloseReceived,

    /// The closing detach frames have been exchanged in both directions
    Closed,
}

/// Frames exchanged between a link and its session event loop
pub(crate) enum LinkFrame {
    Attach(Attach),
    Flow(Flow),
    Transfer {
        performative: Transfer,
        payload: Payload,
        /// Completed by the session event loop when the matching
        /// disposition arrives; `None` for settled transfers
        completion: Option<Arc<AsyncOperationQueue<DeliveryState>>>,
    },
    Disposition(Disposition),
    Detach(fe2o3_amqp_types::performatives::Detach),
}

impl std::fmt::Debug for LinkFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attach(arg0) => f.debug_tuple("Attach").field(arg0).finish(),
            Self::Flow(arg0) => f.debug_tuple("Flow").field(arg0).finish(),
            Self::Transfer {
                performative,
                payload,
                ..
            } => f
                .debug_struct("Transfer")
                .field("performative", performative)
                .field("payload.len", &payload.len())
                .finish(),
            Self::Disposition(arg0) => f.debug_tuple("Disposition").field(arg0).finish(),
            Self::Detach(arg0) => f.debug_tuple("Detach").field(arg0).finish(),
        }
    }
}

/// Credit management mode of a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditMode {
    /// The receiver grants and replenishes credit on its own, topping the
    /// credit back up whenever it drops below half of the given value
    Auto(u32),

    /// The caller manages credit explicitly via
    /// [`Receiver::set_credit`](crate::Receiver::set_credit)
    Manual,
}

impl Default for CreditMode {
    fn default() -> Self {
        Self::Auto(DEFAULT_CREDIT)
    }
}

#[derive(Debug)]
struct LinkProperties {
    source: Option<Source>,
    target: Option<Target>,
    snd_settle_mode: SenderSettleMode,
    rcv_settle_mode: ReceiverSettleMode,
    initial_delivery_count: SequenceNo,
    max_message_size: u64,
    attach_properties: Option<Fields>,
    max_link_credit: u32,
    state: LinkState,
    peer_max_message_size: Option<u64>,
}

#[derive(Debug)]
struct LinkInner {
    name: String,
    role: Role,
    properties: RwLock<LinkProperties>,
}

/// An AMQP 1.0 link.
///
/// The link is a cheaply clonable wrapper over shared state: every clone
/// refers to the same underlying link, so a property set through one clone
/// is observed through all of them. Negotiable properties can only be set
/// before the link attaches; the peer-populated properties are only
/// readable after the attach handshake completed.
#[derive(Debug, Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    /// Creates a new unattached link
    pub fn new(
        name: impl Into<String>,
        role: Role,
        source: impl Into<Option<Source>>,
        target: impl Into<Option<Target>>,
    ) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                name: name.into(),
                role,
                properties: RwLock::new(LinkProperties {
                    source: source.into(),
                    target: target.into(),
                    snd_settle_mode: SenderSettleMode::Unsettled,
                    rcv_settle_mode: ReceiverSettleMode::First,
                    initial_delivery_count: 0,
                    max_message_size: 0,
                    attach_properties: None,
                    max_link_credit: DEFAULT_CREDIT,
                    state: LinkState::Unattached,
                    peer_max_message_size: None,
                }),
            }),
        }
    }

    /// The name of the link
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The role of the link
    pub fn role(&self) -> Role {
        match &self.inner.role {
            Role::Sender => Role::Sender,
            Role::Receiver => Role::Receiver,
        }
    }

    /// The current state of the link
    pub fn state(&self) -> LinkState {
        self.inner.properties.read().state
    }

    /// The source of the link
    pub fn source(&self) -> Option<Source> {
        self.inner.properties.read().source.clone()
    }

    /// Sets the source of the link
    pub fn set_source(&self, source: impl Into<Option<Source>>) -> Result<(), IllegalLinkStateError> {
        let mut props = self.write_negotiable()?;
        props.source = source.into();
        Ok(())
    }

    /// The target of the link
    pub fn target(&self) -> Option<Target> {
        self.inner.properties.read().target.clone()
    }

    /// Sets the target of the link
    pub fn set_target(&self, target: impl Into<Option<Target>>) -> Result<(), IllegalLinkStateError> {
        let mut props = self.write_negotiable()?;
        props.target = target.into();
        Ok(())
    }

    /// The sender settle mode of the link
    pub fn sender_settle_mode(&self) -> SenderSettleMode {
        self.inner.properties.read().snd_settle_mode.clone()
    }

    /// Sets the sender settle mode; only valid before the link attaches
    pub fn set_sender_settle_mode(
        &self,
        mode: SenderSettleMode,
    ) -> Result<(), IllegalLinkStateError> {
        let mut props = self.write_negotiable()?;
        props.snd_settle_mode = mode;
        Ok(())
    }

    /// The receiver settle mode of the link
    pub fn receiver_settle_mode(&self) -> ReceiverSettleMode {
        self.inner.properties.read().rcv_settle_mode.clone()
    }

    /// Sets the receiver settle mode; only valid before the link attaches
    pub fn set_receiver_settle_mode(
        &self,
        mode: ReceiverSettleMode,
    ) -> Result<(), IllegalLinkStateError> {
        let mut props = self.write_negotiable()?;
        props.rcv_settle_mode = mode;
        Ok(())
    }

    /// The initial delivery count announced in the attach frame
    pub fn initial_delivery_count(&self) -> SequenceNo {
        self.inner.properties.read().initial_delivery_count
    }

    /// Sets the initial delivery count; only valid before the link attaches
    pub fn set_initial_delivery_count(
        &self,
        count: SequenceNo,
    ) -> Result<(), IllegalLinkStateError> {
        let mut props = self.write_negotiable()?;
        props.initial_delivery_count = count;
        Ok(())
    }

    /// The max message size of the link; zero means no limit was imposed
    pub fn max_message_size(&self) -> u64 {
        self.inner.properties.read().max_message_size
    }

    /// Sets the max message size; only valid before the link attaches
    pub fn set_max_message_size(&self, size: u64) -> Result<(), IllegalLinkStateError> {
        let mut props = self.write_negotiable()?;
        props.max_message_size = size;
        Ok(())
    }

    /// The properties carried in the attach frame
    pub fn attach_properties(&self) -> Option<Fields> {
        self.inner.properties.read().attach_properties.clone()
    }

    /// Sets the properties carried in the attach frame; only valid before
    /// the link attaches
    pub fn set_attach_properties(&self, properties: Fields) -> Result<(), IllegalLinkStateError> {
        let mut props = self.write_negotiable()?;
        props.attach_properties = Some(properties);
        Ok(())
    }

    /// The maximum link credit a receiver grants
    pub fn max_link_credit(&self) -> u32 {
        self.inner.properties.read().max_link_credit
    }

    /// Sets the maximum link credit; only valid before the link attaches
    pub fn set_max_link_credit(&self, credit: u32) -> Result<(), IllegalLinkStateError> {
        let mut props = self.write_negotiable()?;
        props.max_link_credit = credit;
        Ok(())
    }

    /// The max message size announced by the peer.
    ///
    /// Only populated once the attach handshake completed; fails with
    /// [`IllegalLinkStateError::NotYetAttached`] before that.
    pub fn peer_max_message_size(&self) -> Result<u64, IllegalLinkStateError> {
        self.inner
            .properties
            .read()
            .peer_max_message_size
            .ok_or(IllegalLinkStateError::NotYetAttached)
    }

    fn write_negotiable(
        &self,
    ) -> Result<parking_lot::RwLockWriteGuard<'_, LinkProperties>, IllegalLinkStateError> {
        let props = self.inner.properties.write();
        match props.state {
            LinkState::Unattached | LinkState::Detached => Ok(props),
            _ => Err(IllegalLinkStateError::AlreadyAttached),
        }
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        self.inner.properties.write().state = state;
    }

    /// Populates the peer announced properties from the remote attach
    pub(crate) fn on_remote_attach(&self, remote: &Attach) {
        let mut props = self.inner.properties.write();
        props.peer_max_message_size = Some(remote.max_message_size.unwrap_or(0));
        props.state = LinkState::Attached;
    }

    /// Composes the local attach frame
    pub(crate) fn local_attach(&self, output_handle: u32) -> Attach {
        let props = self.inner.properties.read();
        Attach {
            name: self.inner.name.clone(),
            handle: output_handle.into(),
            role: self.role(),
            snd_settle_mode: props.snd_settle_mode.clone(),
            rcv_settle_mode: props.rcv_settle_mode.clone(),
            source: props.source.clone().map(Box::new),
            target: props
                .target
                .clone()
                .map(|t| Box::new(TargetArchetype::Target(t))),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: match self.inner.role {
                Role::Sender => Some(props.initial_delivery_count),
                Role::Receiver => None,
            },
            max_message_size: match props.max_message_size {
                0 => None,
                size => Some(size),
            },
            offered_capabilities: None,
            desired_capabilities: None,
            properties: props.attach_properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::definitions::{ReceiverSettleMode, Role, SenderSettleMode};
    use fe2o3_amqp_types::messaging::{Source, Target};

    use super::{IllegalLinkStateError, Link, LinkState};

    fn test_link() -> Link {
        Link::new(
            "MySession",
            Role::Sender,
            Source::from("MySource"),
            Target::from("MyTarget"),
        )
    }

    #[test]
    fn new_link_has_protocol_defaults() {
        let link = test_link();
        assert_eq!(link.name(), "MySession");
        assert_eq!(link.initial_delivery_count(), 0);
        assert_eq!(link.max_message_size(), 0);
        assert_eq!(link.sender_settle_mode(), SenderSettleMode::Unsettled);
        assert_eq!(link.receiver_settle_mode(), ReceiverSettleMode::First);
    }

    #[test]
    fn peer_max_message_size_is_unavailable_before_attach() {
        let link = test_link();
        assert!(matches!(
            link.peer_max_message_size(),
            Err(IllegalLinkStateError::NotYetAttached)
        ));
    }

    #[test]
    fn property_set_through_one_clone_is_visible_through_all() {
        let link = test_link();
        let copy = link.clone();

        link.set_initial_delivery_count(32767).unwrap();
        assert_eq!(copy.initial_delivery_count(), 32767);

        copy.set_max_message_size(1024 * 1024).unwrap();
        assert_eq!(link.max_message_size(), 1024 * 1024);
    }

    #[test]
    fn settle_modes_round_trip() {
        let link = test_link();
        for mode in [
            ReceiverSettleMode::First,
            ReceiverSettleMode::Second,
        ] {
            link.set_receiver_settle_mode(mode.clone()).unwrap();
            assert_eq!(link.receiver_settle_mode(), mode);
        }
        for mode in [
            SenderSettleMode::Unsettled,
            SenderSettleMode::Settled,
            SenderSettleMode::Mixed,
        ] {
            link.set_sender_settle_mode(mode.clone()).unwrap();
            assert_eq!(link.sender_settle_mode(), mode);
        }
    }

    #[test]
    fn negotiable_properties_are_frozen_after_attach() {
        let link = test_link();
        link.set_state(LinkState::Attached);
        assert!(matches!(
            link.set_initial_delivery_count(1),
            Err(IllegalLinkStateError::AlreadyAttached)
        ));
        assert!(matches!(
            link.set_sender_settle_mode(SenderSettleMode::Settled),
            Err(IllegalLinkStateError::AlreadyAttached)
        ));
    }
}
