#![deny(missing_docs, missing_debug_implementations)]

//! AMQP 1.0 CBS extension protocol on top of `hematite-amqp-management`.
//!
//! Claims based security authenticates a connection by putting a token to
//! the `$cbs` management node over a dedicated link pair. The CBS client
//! must live strictly within the lifetime of the session it is attached
//! to: close it before ending the session.
//!
//! Please note that the CBS protocol is still in draft; breaking changes
//! are expected in future releases.

pub mod client;
pub mod constants;
pub mod error;
pub mod put_token;
pub mod sas;
pub mod token;

pub use client::CbsClient;
pub use token::{CbsToken, CbsTokenType};

/// A source of CBS tokens.
///
/// Implemented by the SAS credential in this crate
/// ([`sas::SasCredential`]) and by any bearer token credential the
/// application brings.
pub trait CbsTokenProvider {
    /// The associated error type
    type Error;

    /// Get a token for claims against the given resource
    fn get_token(
        &mut self,
        resource_id: impl AsRef<str>,
        claims: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<CbsToken<'_>, Self::Error>;
}
