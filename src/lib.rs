//! `dbglink` - Async client library for remote hardware-debug servers.
//!
//! The servers own all hardware access (link testers, memory controllers,
//! logic analyzers); this crate issues commands over a persistent socket,
//! subscribes to the property-change notifications the servers push, and
//! presents a coherent, thread-safe view of long-running hardware
//! operations.
//!
//! It provides:
//! - socket connection management (Unix/TCP) with an attach handshake
//! - typed JSON (serde) request/response handling with per-call timeout and
//!   cooperative cancellation
//! - a per-object property-change bus with per-subscription queues
//! - scan operations (eye diagram, slicer) with progress, blocking wait,
//!   cancellation, and result reduction into a renderable grid
//!
//! ## Quick start (TCP)
//!
//! ```no_run
//! use dbglink::{Capability, Client, Endpoint, Lane, ScanKind, ScanRegistry};
//! use dbglink::types::InstrumentKind;
//! # async fn demo() -> dbglink::Result<()> {
//! let client = Client::connect(Endpoint::tcp("dbg-host", 3121)).await?;
//!
//! let lane = Lane::new("lane-0", "RX lane 0", InstrumentKind::LinkTester,
//!     [Capability::EyeScan]);
//!
//! let registry = ScanRegistry::new(client.clone());
//! let scan = registry.create(&lane, ScanKind::Eye, None)?;
//!
//! scan.start(&Default::default()).await?;
//! scan.wait().await?;
//!
//! if let Some(grid) = scan.result() {
//!     println!("{} cells, floor {}", grid.len(), grid.floor());
//! }
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod client;
mod notify_stream;
mod transport;

pub mod bus;
pub mod error;
pub mod scan;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use bus::{Listener, PropertyChangeBus, PropertyName, SubscriptionId, UpdateEvent, UpdateQueue};
pub use cancel::CancelToken;
pub use client::{CallOptions, Client, ClientBuilder, ConnectOptions, Endpoint};
pub use error::{Error, ErrorKind, Result};
pub use notify_stream::NotifyStream;
pub use scan::{
    AxisRange, Capability, GridCell, Lane, PointMap, RawTelemetry, ScanGrid, ScanKind,
    ScanOperation, ScanParam, ScanPoint, ScanRegistry, ScanStatus, ValidValues,
};
pub use types::ObjectId;
