use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `error` object a debug server attaches to a failed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error class.
    pub class: String,
    /// Error description.
    pub desc: String,
}

/// Command response.
///
/// A response carries either `return` or `error`, never both, and echoes the
/// request id so the client can correlate it with the issuing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Request id, echoed by the server.
    pub id: Value,

    /// Success payload.
    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}
