//! Wire-level types shared between the client and the mock server.

mod greeting;
mod message;
mod notify;

pub use greeting::{InstrumentDesc, InstrumentKind, ServerGreeting, ServerInfo, ServerVersion};
pub use message::{CommandResponse, RemoteError};
pub use notify::{NotifyMessage, Timestamp};

use serde::{Deserialize, Serialize};

/// Identifier of a remote object on the debug server.
///
/// Objects are the addressable units of the protocol: instruments, lanes,
/// and the handles returned by long-running operation start commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl ObjectId {
    /// Create an object id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
