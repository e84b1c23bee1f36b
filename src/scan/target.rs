//! Scan targets.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, Weak},
};

use crate::{
    scan::{ScanKind, ScanOperation},
    types::{InstrumentKind, ObjectId},
};

/// A scan-related capability a lane may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Capability {
    /// 2D eye-diagram scanning.
    EyeScan,
    /// Slicer-level scanning.
    SlicerScan,
}

/// A receiver lane (or comparable channel) that scans run against.
///
/// Clones share state. The lane keeps a weak "most recent scan" pointer and
/// the list of scan names attached to it; both are maintained by the
/// registry and cleared when an operation is invalidated, so a lane never
/// keeps a dead operation alive.
#[derive(Clone)]
pub struct Lane {
    inner: Arc<LaneInner>,
}

struct LaneInner {
    object: ObjectId,
    label: String,
    instrument: InstrumentKind,
    capabilities: HashSet<Capability>,
    current_scan: Mutex<Weak<ScanOperation>>,
    scan_names: Mutex<Vec<String>>,
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lane")
            .field("object", &self.inner.object)
            .field("label", &self.inner.label)
            .field("instrument", &self.inner.instrument)
            .finish()
    }
}

impl Lane {
    /// Describe a lane.
    pub fn new(
        object: impl Into<ObjectId>,
        label: impl Into<String>,
        instrument: InstrumentKind,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            inner: Arc::new(LaneInner {
                object: object.into(),
                label: label.into(),
                instrument,
                capabilities: capabilities.into_iter().collect(),
                current_scan: Mutex::new(Weak::new()),
                scan_names: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Object id of the lane on the server.
    #[must_use]
    pub fn object(&self) -> &ObjectId {
        &self.inner.object
    }

    /// Human-readable label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Kind of the owning instrument.
    #[must_use]
    pub fn instrument(&self) -> &InstrumentKind {
        &self.inner.instrument
    }

    /// Whether the lane supports the given scan kind.
    #[must_use]
    pub fn supports(&self, kind: ScanKind) -> bool {
        self.inner.capabilities.contains(&kind.capability())
    }

    /// The most recently created scan on this lane, if still alive.
    #[must_use]
    pub fn current_scan(&self) -> Option<Arc<ScanOperation>> {
        self.inner
            .current_scan
            .lock()
            .expect("lane state poisoned")
            .upgrade()
    }

    /// Names of the scans attached to this lane.
    #[must_use]
    pub fn scan_names(&self) -> Vec<String> {
        self.inner
            .scan_names
            .lock()
            .expect("lane state poisoned")
            .clone()
    }

    pub(crate) fn attach_scan(&self, op: &Arc<ScanOperation>) {
        *self
            .inner
            .current_scan
            .lock()
            .expect("lane state poisoned") = Arc::downgrade(op);
        self.inner
            .scan_names
            .lock()
            .expect("lane state poisoned")
            .push(op.name().to_string());
    }

    /// Drop the back-references held for the named scan. Idempotent.
    pub(crate) fn detach_scan(&self, name: &str) {
        {
            let mut cur = self
                .inner
                .current_scan
                .lock()
                .expect("lane state poisoned");
            let points_here = cur.upgrade().is_some_and(|op| op.name() == name);
            if points_here {
                *cur = Weak::new();
            }
        }
        self.inner
            .scan_names
            .lock()
            .expect("lane state poisoned")
            .retain(|n| n != name);
    }
}
