//! Deliveries on the receiving side and sendable messages on the sending
//! side

use fe2o3_amqp_types::{
    definitions::{DeliveryNumber, DeliveryTag, MessageFormat},
    messaging::Message,
};

use crate::util::Uninitialized;

/// A message received on a receiver link together with its delivery
/// bookkeeping
#[derive(Debug)]
pub struct Delivery<T> {
    pub(crate) delivery_id: DeliveryNumber,
    pub(crate) delivery_tag: DeliveryTag,
    pub(crate) message: Message<T>,
}

impl<T> Delivery<T> {
    /// The delivery id assigned by the sender's session
    pub fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }

    /// The delivery tag assigned by the sender
    pub fn delivery_tag(&self) -> &DeliveryTag {
        &self.delivery_tag
    }

    /// A reference to the decoded message
    pub fn message(&self) -> &Message<T> {
        &self.message
    }

    /// Consumes the delivery into the decoded message
    pub fn into_message(self) -> Message<T> {
        self.message
    }

    /// A reference to the message body
    pub fn body(&self) -> &T {
        &self.message.body
    }
}

/// An outgoing message together with its transfer level settings
#[derive(Debug)]
pub struct Sendable<T> {
    pub(crate) message: Message<T>,
    pub(crate) message_format: MessageFormat,
    pub(crate) settled: Option<bool>,
}

impl Sendable<Uninitialized> {
    /// Creates a builder for [`Sendable`]
    pub fn builder() -> Builder<Uninitialized> {
        Builder::new()
    }
}

impl<T> From<Message<T>> for Sendable<T> {
    fn from(message: Message<T>) -> Self {
        Self {
            message,
            message_format: 0,
            settled: None,
        }
    }
}

/// Builder for [`Sendable`]
#[derive(Debug)]
pub struct Builder<T> {
    /// The message to send
    pub message: T,

    /// The message format of the transfer
    pub message_format: MessageFormat,

    /// Whether the transfer is sent settled
    pub settled: Option<bool>,
}

impl Default for Builder<Uninitialized> {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder<Uninitialized> {
    /// Creates a new builder
    pub fn new() -> Self {
        Self {
            message: Uninitialized {},
            message_format: 0,
            settled: None,
        }
    }
}

impl<State> Builder<State> {
    /// Sets the message
    pub fn message<T>(self, message: impl Into<Message<T>>) -> Builder<Message<T>> {
        Builder {
            message: message.into(),
            message_format: self.message_format,
            settled: self.settled,
        }
    }

    /// Sets the message format
    pub fn message_format(mut self, message_format: impl Into<MessageFormat>) -> Self {
        self.message_format = message_format.into();
        self
    }

    /// Sets whether the transfer is sent settled
    pub fn settled(mut self, settled: impl Into<Option<bool>>) -> Self {
        self.settled = settled.into();
        self
    }
}

impl<T> Builder<Message<T>> {
    /// Builds the [`Sendable`]
    pub fn build(self) -> Sendable<T> {
        Sendable {
            message: self.message,
            message_format: self.message_format,
            settled: self.settled,
        }
    }
}

impl<T> From<Builder<Message<T>>> for Sendable<T> {
    fn from(builder: Builder<Message<T>>) -> Self {
        builder.build()
    }
}
