#![deny(missing_docs, missing_debug_implementations)]

//! An AMQP 1.0 protocol engine built on [`tokio`] and [`serde_amqp`].
//!
//! The crate implements everything between a byte stream and application
//! messaging semantics: transport framing and protocol header negotiation,
//! the connection, session and link state machines, message senders and
//! receivers with credit-based flow control, and the listener-side acceptors.
//! Encoding and decoding of AMQP values and performatives is delegated to
//! [`serde_amqp`] and [`fe2o3_amqp_types`].
//!
//! Every protocol entity is driven by an event loop that is advanced one unit
//! of work at a time (`poll_once`) and is, by default, spawned onto the tokio
//! runtime. Handles communicate with the event loops over channels, so no
//! callback can ever observe a torn-down endpoint; sending to a stopped event
//! loop fails with an illegal-state error instead.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut connection = Connection::open("connection-1", "amqp://localhost:5672").await?;
//! let mut session = Session::begin(&mut connection).await?;
//! let mut sender = Sender::attach(&mut session, "sender-1", "q1").await?;
//!
//! let outcome = sender.send("hello AMQP").await?;
//! outcome.accepted_or("the delivery was not accepted")?;
//!
//! sender.close().await?;
//! session.end().await?;
//! connection.close().await?;
//! ```

pub mod acceptor;
pub mod connection;
pub mod frames;
pub mod link;
pub mod sasl_profile;
pub mod session;
pub mod transport;
pub mod util;

pub(crate) mod control;

pub use connection::Connection;
pub use link::{
    delivery::{Delivery, Sendable},
    receiver::Receiver,
    sender::Sender,
    Link, LinkState,
};
pub use session::Session;

/// Type alias for a transfer payload
pub type Payload = bytes::Bytes;
