//! Error model for the `dbglink` crate.
//!
//! Two failure classes deliberately have no variant here: invalid
//! configuration values (logged as warnings and dropped from the outgoing
//! command) and panicking user listeners (caught at the call site and
//! logged). Both are contained where they occur and never surface as
//! `Error`s.

use std::time::Duration;

use thiserror::Error;

/// Convenience result type.
pub type Result<T> = std::result::Result<T, Error>;

/// High-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An I/O level failure (socket, EOF, etc.).
    Io,
    /// JSON encoding/decoding failure.
    Json,
    /// Protocol violation or unexpected message.
    Protocol,
    /// The server returned an error object for a command.
    Remote,
    /// The connection was closed.
    Disconnected,
    /// The call timed out.
    Timeout,
    /// The call was cancelled.
    Cancelled,
    /// An operation was used in a state that does not permit it.
    State,
    /// The notification stream receiver fell behind and dropped messages.
    Lagged,
}

/// Structured error type.
///
/// This type is designed to be:
/// - **diagnosable** (keeps context when available)
/// - **safe by default** (no sensitive data in `Display`)
/// - **extensible** (`#[non_exhaustive]`)
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket / file I/O error.
    #[error("I/O error: {source}")]
    Io {
        /// Lower-level error.
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {source}")]
    Json {
        /// Lower-level error.
        #[from]
        source: serde_json::Error,
    },

    /// The server sent an unexpected or invalid message.
    #[error("protocol error: {message}")]
    Protocol {
        /// Human readable message.
        message: String,
    },

    /// The server returned an error for a command.
    #[error("command '{command}' failed: {class}: {desc}")]
    Remote {
        /// Command name.
        command: String,
        /// Server error class.
        class: String,
        /// Server error description.
        desc: String,
    },

    /// The connection closed while a request was in-flight.
    #[error("connection closed")]
    Disconnected,

    /// A command call exceeded the configured timeout.
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout value.
        timeout: Duration,
    },

    /// A command call was cancelled.
    #[error("command cancelled")]
    Cancelled,

    /// An operation was used in a state that does not permit it, e.g.
    /// waiting on a scan that was never started, or restarting one that is
    /// still in progress.
    #[error("invalid state: {message}")]
    State {
        /// What was attempted and why it is not allowed right now.
        message: String,
    },

    /// The notification receiver lagged behind and dropped messages.
    #[error("notification stream lagged behind and dropped {missed} messages")]
    Lagged {
        /// How many notifications were dropped.
        missed: usize,
    },
}

impl Error {
    /// Returns a coarse error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::Json { .. } => ErrorKind::Json,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Disconnected => ErrorKind::Disconnected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::State { .. } => ErrorKind::State,
            Self::Lagged { .. } => ErrorKind::Lagged,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn remote(
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        Self::Remote {
            command: command.into(),
            class: class.into(),
            desc: desc.into(),
        }
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create an owned copy of this error suitable for fanning out to
    /// multiple waiters.
    ///
    /// `Error` is intentionally not `Clone`. The reader task needs to fail
    /// every pending call when the connection drops; this helper provides a
    /// best-effort owned copy while keeping the error structure.
    pub(crate) fn clone_for_task(&self) -> Self {
        match self {
            Self::Io { .. } => Self::Disconnected,
            Self::Json { .. } => Self::Disconnected,
            Self::Protocol { message } => Self::Protocol {
                message: message.clone(),
            },
            Self::Remote {
                command,
                class,
                desc,
            } => Self::Remote {
                command: command.clone(),
                class: class.clone(),
                desc: desc.clone(),
            },
            Self::Disconnected => Self::Disconnected,
            Self::Timeout { timeout } => Self::Timeout { timeout: *timeout },
            Self::Cancelled => Self::Cancelled,
            Self::State { message } => Self::State {
                message: message.clone(),
            },
            Self::Lagged { missed } => Self::Lagged { missed: *missed },
        }
    }
}
