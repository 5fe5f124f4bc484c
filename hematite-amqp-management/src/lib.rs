#![deny(missing_docs, missing_debug_implementations)]

//! AMQP 1.0 management working draft on top of `hematite-amqp`.
//!
//! A management client owns a request link and a response link attached to
//! a management node; every request is stamped with the `operation`, `type`
//! and `locales` application properties and a message id, and the matching
//! response is correlated back by its correlation id and judged by the
//! `statusCode`/`statusDescription` application properties.

pub mod client;
pub mod constants;
pub mod error;
pub mod operations;
pub mod request;
pub mod response;
pub mod status;

/// The default address of the management node
pub const MANAGEMENT_NODE_ADDRESS: &str = "$management";

/// The default address of the client node
pub const DEFAULT_CLIENT_NODE_ADDRESS: &str = "mgmt-client";

pub use client::MgmtClient;
pub use request::Request;
pub use response::Response;
