use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::ObjectId;

/// Capture timestamp attached to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since epoch.
    pub seconds: i64,

    /// Microseconds within the second.
    pub microseconds: i64,
}

impl Timestamp {
    /// A zero timestamp, used when the server omits one.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            seconds: 0,
            microseconds: 0,
        }
    }
}

/// A property-change notification as it appears on the wire.
///
/// The server coalesces all properties of one object that changed together
/// into a single message; names are unique within one message by
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyMessage {
    /// The remote object whose properties changed.
    #[serde(rename = "notify")]
    pub object: ObjectId,

    /// Changed property names and their new values.
    #[serde(default)]
    pub changed: Map<String, Value>,

    /// Capture timestamp.
    pub timestamp: Option<Timestamp>,
}
