//! Scan operations.
//!
//! A scan is a long-running remote measurement (eye diagram, slicer sweep)
//! driven over the property-change bus. [`ScanRegistry`] owns every live
//! [`ScanOperation`]; lanes hold only weak back-references.

mod operation;
pub(crate) mod params;
pub mod reduce;
mod target;
pub mod telemetry;

pub use operation::{ScanOperation, ScanStatus};
pub use params::{ScanParam, ValidValues};
pub use reduce::{AxisRange, GridCell, PointMap, ScanGrid, ScanPoint};
pub use target::{Capability, Lane};
pub use telemetry::{RawTelemetry, TelemetryChunk};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    client::Client,
    error::{Error, Result},
};

/// Kind of scan a lane can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ScanKind {
    /// 2D eye-diagram scan.
    Eye,
    /// Slicer-level scan.
    Slicer,
}

impl ScanKind {
    /// The remote command that starts a scan of this kind.
    #[must_use]
    pub fn start_command(self) -> &'static str {
        match self {
            Self::Eye => "start-eye-scan",
            Self::Slicer => "start-slicer-scan",
        }
    }

    /// The capability a lane must advertise to run this kind.
    #[must_use]
    pub fn capability(self) -> Capability {
        match self {
            Self::Eye => Capability::EyeScan,
            Self::Slicer => Capability::SlicerScan,
        }
    }
}

/// Default scan name prefix; created names look like `Scan_0`, `Scan_1`, …
const DEFAULT_NAME_PREFIX: &str = "Scan_";

struct RegistryState {
    ops: HashMap<String, Arc<ScanOperation>>,
    next_suffix: u64,
}

/// Owner of all live scan operations for one client session.
///
/// Invariants: names are unique at all times, default-name suffixes are
/// never reused while any scan is live, and the suffix counter resets once
/// the registry becomes empty. No other component may destroy an operation.
pub struct ScanRegistry {
    client: Client,
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for ScanRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRegistry")
            .field("scans", &self.names())
            .finish()
    }
}

impl ScanRegistry {
    /// Create an empty registry bound to a client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            state: Mutex::new(RegistryState {
                ops: HashMap::new(),
                next_suffix: 0,
            }),
        }
    }

    /// Create a scan operation on a lane.
    ///
    /// The lane must advertise the capability for `kind`. When `name` is
    /// `None` a default `Scan_<n>` name is allocated. The new operation
    /// becomes the lane's current scan. Errors with [`Error::State`] on a
    /// missing capability or a duplicate explicit name.
    pub fn create(
        &self,
        lane: &Lane,
        kind: ScanKind,
        name: Option<&str>,
    ) -> Result<Arc<ScanOperation>> {
        if !lane.supports(kind) {
            return Err(Error::state(format!(
                "lane '{}' does not support {:?} scans",
                lane.object(),
                kind
            )));
        }

        let mut state = self.state.lock().expect("registry state poisoned");

        let name = match name {
            Some(explicit) => {
                if state.ops.contains_key(explicit) {
                    return Err(Error::state(format!(
                        "a scan named '{explicit}' already exists"
                    )));
                }
                explicit.to_string()
            }
            None => loop {
                let candidate = format!("{DEFAULT_NAME_PREFIX}{}", state.next_suffix);
                state.next_suffix += 1;
                if !state.ops.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let op = Arc::new(ScanOperation::new(
            name.clone(),
            kind,
            lane.clone(),
            self.client.clone(),
        ));
        lane.attach_scan(&op);
        state.ops.insert(name, op.clone());

        tracing::debug!(scan = op.name(), lane = %lane.object(), "scan created");
        Ok(op)
    }

    /// Invalidate and remove operations.
    ///
    /// Once the registry is empty the default-name counter resets, so the
    /// next created scan is `Scan_0` again.
    pub fn delete(&self, ops: &[Arc<ScanOperation>]) {
        for op in ops {
            op.invalidate();
        }

        let mut state = self.state.lock().expect("registry state poisoned");
        for op in ops {
            state.ops.remove(op.name());
        }
        if state.ops.is_empty() {
            state.next_suffix = 0;
        }
    }

    /// Look up an operation by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ScanOperation>> {
        self.state
            .lock()
            .expect("registry state poisoned")
            .ops
            .get(name)
            .cloned()
    }

    /// Names of all live operations, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .expect("registry state poisoned")
            .ops
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of live operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("registry state poisoned").ops.len()
    }

    /// Whether the registry holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
