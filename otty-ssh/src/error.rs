use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::auth::AuthMechanism;
use crate::connection::Phase;

/// Errors produced by the SSH engine.
///
/// Errors are cheap to clone so one failure can be delivered to every
/// pending operation it affects.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    #[error("poll error: {0}")]
    Poll(Arc<io::Error>),

    #[error("socket closed by peer")]
    Hangup,

    #[error("{context}: {message}")]
    Protocol {
        context: &'static str,
        message: String,
    },

    #[error("failed to parse ssh address: {0}")]
    AddressParsing(String),

    #[error("failed to resolve {0}")]
    Resolve(String),

    #[error("{operation} is not allowed while the connection is {phase}")]
    InvalidState {
        operation: &'static str,
        phase: Phase,
    },

    #[error("{0} is already pending")]
    AlreadyPending(&'static str),

    #[error("stream is closed")]
    Closed,

    #[error("channel has no pty")]
    NoPty,

    #[error("no credentials available")]
    NoCredentials,

    #[error("authentication mechanism {0} is not supported")]
    UnsupportedMechanism(AuthMechanism),

    #[error("blocking operations cannot be nested")]
    NestedBlocking,

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection reset")]
    Disconnected,
}

impl Error {
    /// Whether the operation was cancelled by its caller.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether the error reports API misuse rather than a remote failure.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::InvalidState { .. }
                | Error::AlreadyPending(_)
                | Error::Closed
                | Error::NoPty
                | Error::NestedBlocking
        )
    }

    /// Errors that end one operation without poisoning the connection.
    pub(crate) fn is_operation_scoped(&self) -> bool {
        matches!(
            self,
            Error::Cancelled
                | Error::NoCredentials
                | Error::UnsupportedMechanism(_)
        )
    }

    pub(crate) fn poll(err: io::Error) -> Self {
        Error::Poll(Arc::new(err))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
