use serde::{Deserialize, Serialize};

use crate::types::ObjectId;

/// Greeting message.
///
/// The debug server sends this as the very first JSON object after the
/// socket is connected, before the client has attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGreeting {
    /// Server meta information.
    #[serde(rename = "dbglink")]
    pub server: ServerInfo,
}

/// `dbglink` section of the greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server version.
    pub version: ServerVersion,

    /// Server package string (when available).
    #[serde(default)]
    pub package: String,

    /// Instruments this server exposes.
    #[serde(default)]
    pub instruments: Vec<InstrumentDesc>,

    /// Supported protocol capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Numeric server version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    /// Major version.
    pub major: u64,
    /// Minor version.
    pub minor: u64,
    /// Micro version.
    pub micro: u64,
}

/// One instrument advertised in the greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentDesc {
    /// Object id of the instrument.
    pub id: ObjectId,

    /// Instrument kind.
    pub kind: InstrumentKind,

    /// Object ids of the lanes (or channels) the instrument exposes.
    #[serde(default)]
    pub lanes: Vec<ObjectId>,
}

/// Kind of a remote instrument.
///
/// The server reports the kind as a type string; it is resolved into this
/// closed set exactly once at decode time. Strings outside the known set
/// land in [`InstrumentKind::Unknown`] rather than failing the decode, so a
/// newer server does not break an older client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum InstrumentKind {
    /// High-speed serial link tester (eye/slicer scans).
    #[serde(rename = "link-tester")]
    LinkTester,
    /// Memory controller with margining support.
    #[serde(rename = "memory-controller")]
    MemoryController,
    /// Logic analyzer core.
    #[serde(rename = "logic-analyzer")]
    LogicAnalyzer,
    /// A kind this client does not know about.
    #[serde(untagged)]
    Unknown(String),
}

impl InstrumentKind {
    /// Whether the kind was recognized.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}
