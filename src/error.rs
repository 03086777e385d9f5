//! Error types shared by the executor, queue, timer and connection layers.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the crate can report.
///
/// I/O and protocol failures are delivered to connection callbacks as
/// `Option<&Error>`; they are never thrown across the reactor boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport failure (connect, bind, send, recv) carrying the OS error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A synchronous or bounded operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Certificate, key or handshake failure. Always terminal for the connection.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed HTTP or WebSocket framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid construction parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// Work was submitted to an executor that no longer accepts it.
    #[error("executor `{0}` has been stopped")]
    ExecutorStopped(String),

    /// The operation needs an established connection.
    #[error("not connected")]
    NotConnected,

    /// The connection has already been closed.
    #[error("connection closed")]
    Closed,

    /// The operation is not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A spawned future panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// A spawned future was abandoned because its executor stopped.
    #[error("task aborted before completion")]
    Aborted,

    /// Blocking here would wait on the calling thread itself.
    #[error("join would deadlock: called from the thread running the task")]
    WouldDeadlock,
}

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Tls,
    Protocol,
    Task,
    Usage,
}

impl Error {
    /// Create a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Error::Tls(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState(message.into())
    }

    /// Which part of the taxonomy this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(e) if e.kind() == io::ErrorKind::TimedOut => ErrorKind::Timeout,
            Error::Io(_) | Error::NotConnected | Error::Closed => ErrorKind::Transport,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Tls(_) => ErrorKind::Tls,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Panicked(_) | Error::Aborted => ErrorKind::Task,
            Error::Config(_)
            | Error::ExecutorStopped(_)
            | Error::InvalidState(_)
            | Error::WouldDeadlock => ErrorKind::Usage,
        }
    }

    /// Check whether this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// The platform error code, for transport errors that carry one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Check if this error means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Closed | Error::NotConnected => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Render a panic payload the way it was raised.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
