//! Keepsafe Core Library
//!
//! Shared building blocks for the keepsafe client and server: the typed
//! record model, the pure last-write-wins merge engine, the bearer-token
//! authority, and the framed wire protocol spoken on the sync surface.

pub mod merge;
pub mod model;
pub mod proto;
pub mod token;

pub use merge::{merge, MergeOutcome, TieBreak};
pub use model::{DataItem, DataKind};
pub use token::{Claims, TokenAuthority};

use thiserror::Error;

/// Result type for keepsafe operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by both sides of the protocol.
///
/// Every failure that crosses a process boundary is expressed as one of
/// these variants; [`Error::to_status`] and [`Error::from_status`]
/// convert to and from the wire form.
#[derive(Debug, Error)]
pub enum Error {
    /// Token missing, malformed, expired, wrongly signed, or signed with
    /// an unexpected algorithm.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Duplicate ids, missing fields, unparseable timestamps, oversized
    /// chunks, or bad frames.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// File blob absent on download; record absent on delete.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate username at registration.
    #[error("conflict: {0}")]
    Conflict(String),

    /// I/O failure on a repository or the filesystem; retriable.
    #[error("transient: {0}")]
    Transient(String),

    /// The caller's deadline or cancel signal fired.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation inside the server.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Wire status for this error.
    pub fn to_status(&self) -> proto::Status {
        use proto::ErrorCode;
        let code = match self {
            Error::Unauthenticated(_) => ErrorCode::Unauthenticated,
            Error::MalformedInput(_) => ErrorCode::MalformedInput,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Conflict(_) => ErrorCode::Conflict,
            Error::Transient(_) => ErrorCode::Transient,
            Error::Cancelled => ErrorCode::Cancelled,
            Error::Internal(_) => ErrorCode::Internal,
        };
        let message = match self {
            Error::Cancelled => "cancelled".to_string(),
            Error::Unauthenticated(m)
            | Error::MalformedInput(m)
            | Error::NotFound(m)
            | Error::Conflict(m)
            | Error::Transient(m)
            | Error::Internal(m) => m.clone(),
        };
        proto::Status { code, message }
    }

    /// Rebuild an error from its wire status.
    pub fn from_status(status: proto::Status) -> Self {
        use proto::ErrorCode;
        match status.code {
            ErrorCode::Unauthenticated => Error::Unauthenticated(status.message),
            ErrorCode::MalformedInput => Error::MalformedInput(status.message),
            ErrorCode::NotFound => Error::NotFound(status.message),
            ErrorCode::Conflict => Error::Conflict(status.message),
            ErrorCode::Transient => Error::Transient(status.message),
            ErrorCode::Cancelled => Error::Cancelled,
            ErrorCode::Internal => Error::Internal(status.message),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transient(e.to_string())
    }
}
