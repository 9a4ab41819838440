//! Error taxonomy for the proxy.
//!
//! Every fallible operation returns [`Error`]. Callers that need to make a
//! decision (retry, deny, abort startup) look at [`Error::kind`] or
//! [`Error::is_retryable`] instead of inspecting messages.
//!
//! # Classification
//!
//! | Kind | Raised by | Retried |
//! |------|-----------|---------|
//! | `Configuration` | URI parsing, key material, durations | never |
//! | `Authentication` | no verifier accepted a credential | never |
//! | `Transport` | handshake failure, connection found dead on use | once, on a fresh handle |
//! | `Protocol` | the peer refused one request on a healthy connection | never |
//! | `Resource` | permission or authorized-key file unreadable | never (treated as deny) |
//! | `Cancelled` | the caller's cancellation scope fired | never |
//! | `Closed` | the dialer was shut down | never |
//!
//! A failed handshake is reported as [`Error::Connect`]: it has the transport
//! kind but is surfaced immediately, because there is no established handle
//! to invalidate and retry against.

use thiserror::Error;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Transport,
    Protocol,
    Resource,
    Cancelled,
    Closed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Deliberately carries no detail about which verifier rejected.
    #[error("authentication failed")]
    Authentication,

    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request rejected: {0}")]
    Protocol(String),

    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("dialer is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::Authentication => ErrorKind::Authentication,
            Error::Connect { .. } | Error::Transport(_) => ErrorKind::Transport,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Resource(_) => ErrorKind::Resource,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Closed => ErrorKind::Closed,
        }
    }

    /// True when the handle that produced this error is dead and the
    /// operation may be repeated against a new one.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub(crate) fn connect(address: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Connect {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

/// Structural classification of errors coming out of russh.
///
/// A refused channel or a denied global request means the peer is alive and
/// answered; anything else means the connection can no longer be trusted.
impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::ChannelOpenFailure(reason) => {
                Error::Protocol(format!("channel open refused: {:?}", reason))
            }
            russh::Error::RequestDenied => Error::Protocol("request denied".to_string()),
            other => Error::Transport(other.to_string()),
        }
    }
}
