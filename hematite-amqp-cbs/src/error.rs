//! Errors of the CBS client

use crate::token::CbsTokenType;

pub use hematite_amqp_management::error::{AttachError, Error as MgmtError, StatusError};

/// Error performing a CBS operation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The token type is not supported by the put-token implementation.
    ///
    /// The error is raised before any frame is sent.
    #[error("Token type {0} is not supported")]
    UnsupportedTokenType(CbsTokenType),

    /// The CBS link pair failed to attach
    #[error(transparent)]
    Attach(#[from] AttachError),

    /// The underlying management operation failed
    #[error(transparent)]
    Mgmt(#[from] MgmtError),

    /// The token provider failed to produce a token
    #[error(transparent)]
    Credential(#[from] crate::sas::SasCredentialError),
}

/// Convenience alias
pub type Result<T> = std::result::Result<T, Error>;
