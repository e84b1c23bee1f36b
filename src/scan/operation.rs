//! The scan operation state machine.
//!
//! One `ScanOperation` represents one remote long-running measurement. The
//! merge step runs on the client's reader task via a bus listener; every
//! other method runs on arbitrary caller tasks. Per the crate's delivery
//! discipline, the operation's mutex is held only around field mutation,
//! never across the completion callback or any transport call.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;

use crate::{
    bus::{Listener, PropertyChangeBus, UpdateEvent, UpdateQueue},
    client::Client,
    error::{Error, Result},
    scan::{
        Lane, ScanKind,
        params::{self, ScanParam},
        reduce::{self, AxisRange, PointMap, ScanGrid},
        telemetry::{RawTelemetry, TelemetryChunk},
    },
    types::{ObjectId, Timestamp},
};

/// Lifecycle state of a scan operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanStatus {
    /// Created, or reset by a new `start()` cycle; no update seen yet.
    NotStarted,
    /// The hardware has accepted the scan and updates are flowing.
    InProgress,
    /// Finished successfully; the reduced result is available.
    Done,
    /// Terminated by the server, either on request or on a hardware error.
    Aborted,
}

impl ScanStatus {
    /// Whether the state is terminal for the current cycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

/// Property names carried on a scan handle's update channel.
const UPDATE_PROPERTIES: [&str; 9] = [
    "status",
    "progress",
    "start-time",
    "stop-time",
    "firmware",
    "expected-samples",
    "observed-samples",
    "telemetry",
    "points",
];

#[derive(Deserialize)]
struct StartReply {
    handle: ObjectId,
}

/// One-shot completion signal, re-created for every `start()` cycle and
/// fired exactly once by the merge step when a terminal status is observed.
#[derive(Debug, Default)]
struct Completion {
    fired: AtomicBool,
    notify: Notify,
}

impl Completion {
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before the flag check so a fire() racing this call
        // cannot slip between the check and the await.
        notified.as_mut().enable();
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

type CompleteFn = Arc<dyn Fn(ScanStatus) + Send + Sync>;

/// Mutable per-cycle fields, all behind one short-held mutex.
///
/// `generation` identifies the cycle; it survives resets (the reset sites
/// bump it) so work captured under an earlier lock hold can detect that a
/// restart or invalidation happened in between and discard its result.
struct CycleState {
    generation: u64,
    start_pending: bool,
    status: ScanStatus,
    status_text: Option<String>,
    progress: f64,
    handle: Option<ObjectId>,
    started_at: Option<Timestamp>,
    stopped_at: Option<Timestamp>,
    firmware: Option<String>,
    expected_samples: Option<u64>,
    observed_samples: Option<u64>,
    telemetry: RawTelemetry,
    points: PointMap,
    result: Option<Arc<ScanGrid>>,
    x_range: AxisRange,
    floor: f64,
    completion: Option<Arc<Completion>>,
    subscription: Option<Arc<PropertyChangeBus>>,
}

impl CycleState {
    fn fresh() -> Self {
        Self {
            generation: 0,
            start_pending: false,
            status: ScanStatus::NotStarted,
            status_text: None,
            progress: 0.0,
            handle: None,
            started_at: None,
            stopped_at: None,
            firmware: None,
            expected_samples: None,
            observed_samples: None,
            telemetry: RawTelemetry::default(),
            points: PointMap::new(),
            result: None,
            x_range: AxisRange {
                min: -0.5,
                max: 0.5,
            },
            floor: 1e-12,
            completion: None,
            subscription: None,
        }
    }

    /// Replace everything with a fresh cycle, advancing the generation.
    fn reset(&mut self) {
        let generation = self.generation + 1;
        *self = Self::fresh();
        self.generation = generation;
    }
}

/// A remote long-running measurement on one lane.
///
/// Created by [`ScanRegistry::create`] and destroyed only through
/// [`ScanRegistry::delete`]; the registry is the sole lifetime owner.
///
/// [`ScanRegistry::create`]: crate::scan::ScanRegistry::create
/// [`ScanRegistry::delete`]: crate::scan::ScanRegistry::delete
pub struct ScanOperation {
    name: String,
    kind: ScanKind,
    lane: Lane,
    client: Client,
    params: Vec<ScanParam>,
    state: Mutex<CycleState>,
    on_complete: Mutex<Option<CompleteFn>>,
    invalidated: AtomicBool,
}

impl std::fmt::Debug for ScanOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOperation")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("lane", self.lane.object())
            .field("status", &self.status())
            .finish()
    }
}

impl ScanOperation {
    pub(crate) fn new(name: String, kind: ScanKind, lane: Lane, client: Client) -> Self {
        Self {
            name,
            kind,
            lane,
            client,
            params: params::params_for(kind),
            state: Mutex::new(CycleState::fresh()),
            on_complete: Mutex::new(None),
            invalidated: AtomicBool::new(false),
        }
    }

    /// Registry-unique name of this operation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of scan.
    #[must_use]
    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    /// The lane this scan runs against.
    #[must_use]
    pub fn lane(&self) -> &Lane {
        &self.lane
    }

    /// Declared configuration parameters for this scan kind.
    #[must_use]
    pub fn params(&self) -> &[ScanParam] {
        &self.params
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ScanStatus {
        self.state().status
    }

    /// Server-reported status text, e.g. an abort reason.
    #[must_use]
    pub fn status_text(&self) -> Option<String> {
        self.state().status_text.clone()
    }

    /// Progress percentage (0–100).
    #[must_use]
    pub fn progress(&self) -> f64 {
        self.state().progress
    }

    /// The operation handle returned by the start command, if started.
    #[must_use]
    pub fn handle(&self) -> Option<ObjectId> {
        self.state().handle.clone()
    }

    /// Hardware-reported start timestamp.
    #[must_use]
    pub fn started_at(&self) -> Option<Timestamp> {
        self.state().started_at
    }

    /// Hardware-reported stop timestamp.
    #[must_use]
    pub fn stopped_at(&self) -> Option<Timestamp> {
        self.state().stopped_at
    }

    /// Firmware/version string reported for this cycle.
    #[must_use]
    pub fn firmware(&self) -> Option<String> {
        self.state().firmware.clone()
    }

    /// Expected total sample count, once reported.
    #[must_use]
    pub fn expected_samples(&self) -> Option<u64> {
        self.state().expected_samples
    }

    /// Observed sample count, once reported.
    #[must_use]
    pub fn observed_samples(&self) -> Option<u64> {
        self.state().observed_samples
    }

    /// Snapshot of the raw telemetry accumulated so far.
    ///
    /// Safe to call while the scan is running; the snapshot is taken under
    /// the state lock, so fields are never torn mid-append.
    #[must_use]
    pub fn telemetry(&self) -> RawTelemetry {
        self.state().telemetry.clone()
    }

    /// Snapshot of the merged scan points accumulated so far.
    #[must_use]
    pub fn points(&self) -> PointMap {
        self.state().points.clone()
    }

    /// The reduced result grid; `None` until a cycle completes with
    /// [`ScanStatus::Done`].
    #[must_use]
    pub fn result(&self) -> Option<Arc<ScanGrid>> {
        self.state().result.clone()
    }

    /// Register the completion callback for this operation.
    ///
    /// Invoked from the reader task when a cycle reaches a terminal state,
    /// after the result (if any) is in place. Panics are caught and logged.
    /// Replaces any previously registered callback.
    pub fn on_complete(&self, f: impl Fn(ScanStatus) + Send + Sync + 'static) {
        *self
            .on_complete
            .lock()
            .expect("scan callback slot poisoned") = Some(Arc::new(f));
    }

    /// Start (or restart) the scan.
    ///
    /// The previous cycle's accumulated data is cleared first. Configuration
    /// values that are unknown, non-modifiable, or outside their valid set
    /// are dropped with a warning; the rest are sent with the remote start
    /// command. On success the operation is subscribed to the update channel
    /// of the returned handle; the transition to `InProgress` happens when
    /// the first update arrives, not here.
    ///
    /// Errors with [`Error::State`] if the previous cycle is still
    /// `InProgress` (stop and wait first) or if the operation has been
    /// invalidated; a remote failure leaves the operation in `NotStarted`.
    pub async fn start(self: &Arc<Self>, config: &HashMap<String, Value>) -> Result<()> {
        self.ensure_valid()?;

        let (old_bus, generation) = {
            let mut st = self.state.lock().expect("scan state poisoned");
            if st.status == ScanStatus::InProgress {
                return Err(Error::state(format!(
                    "scan '{}' is still in progress; stop it before restarting",
                    self.name
                )));
            }
            if st.start_pending {
                return Err(Error::state(format!(
                    "scan '{}' already has a start call in flight",
                    self.name
                )));
            }
            let old_bus = st.subscription.take();
            st.reset();
            st.start_pending = true;
            (old_bus, st.generation)
        };
        if let Some(bus) = old_bus {
            bus.unsubscribe(UPDATE_PROPERTIES.iter().copied());
            self.client.release_bus(bus.object());
        }

        let outcome = self.start_cycle(config, generation).await;

        let mut st = self.state();
        if st.generation == generation {
            st.start_pending = false;
        }
        outcome
    }

    /// The fallible part of `start()`. `generation` is the cycle this call
    /// belongs to; if it no longer matches when the remote reply arrives,
    /// the operation was invalidated in the meantime and the reply is
    /// discarded.
    async fn start_cycle(
        self: &Arc<Self>,
        config: &HashMap<String, Value>,
        generation: u64,
    ) -> Result<()> {
        let accepted = params::validate_config(&self.params, config);

        let x_range = params::effective(&self.params, &accepted, "horz-range")
            .and_then(Value::as_str)
            .map(AxisRange::parse)
            .transpose()?
            .unwrap_or(AxisRange {
                min: -0.5,
                max: 0.5,
            });
        let floor = params::effective(&self.params, &accepted, "ber-floor")
            .and_then(Value::as_f64)
            .unwrap_or(1e-12);

        let reply: StartReply = self
            .client
            .command(
                self.lane.object(),
                self.kind.start_command(),
                Some(Value::Object(accepted)),
            )
            .await?;

        tracing::debug!(
            scan = %self.name,
            handle = %reply.handle,
            "scan start accepted"
        );

        let completion = Arc::new(Completion::default());
        let bus = self.client.bus(&reply.handle);

        {
            let mut st = self.state.lock().expect("scan state poisoned");
            if st.generation != generation || self.is_invalidated() {
                drop(st);
                self.client.release_bus(bus.object());
                return Err(Error::state(format!(
                    "scan '{}' was invalidated while starting",
                    self.name
                )));
            }
            st.handle = Some(reply.handle);
            st.x_range = x_range;
            st.floor = floor;
            st.completion = Some(completion);
            st.subscription = Some(bus.clone());
        }

        let weak = Arc::downgrade(self);
        let listener: Listener = Arc::new(move |queue: &UpdateQueue| {
            let Some(op) = weak.upgrade() else {
                return;
            };
            for event in queue.drain() {
                op.apply_update(&event);
            }
        });
        bus.subscribe(UPDATE_PROPERTIES.iter().copied(), vec![listener])?;

        Ok(())
    }

    /// Request termination of the current cycle.
    ///
    /// Fire-and-forget from the caller's perspective: local state does not
    /// change here. The server is expected to report `Aborted` through the
    /// normal update path, which is when `wait()` wakes up.
    pub async fn stop(&self) -> Result<()> {
        self.ensure_valid()?;

        let handle = self
            .state()
            .handle
            .clone()
            .ok_or_else(|| Error::state(format!("scan '{}' has not been started", self.name)))?;

        let _: Value = self.client.command::<(), _>(&handle, "terminate", None).await?;
        Ok(())
    }

    /// Block until the current cycle reaches a terminal state.
    ///
    /// Returns immediately if the cycle is already terminal. Errors with
    /// [`Error::State`] if called before `start()`. Note that an `Aborted`
    /// cycle also completes the wait normally; inspect [`status`] and
    /// [`status_text`] afterwards.
    ///
    /// [`status`]: Self::status
    /// [`status_text`]: Self::status_text
    pub async fn wait(&self) -> Result<()> {
        let completion = self.state().completion.clone().ok_or_else(|| {
            Error::state(format!("scan '{}' has not been started", self.name))
        })?;

        completion.wait().await;
        Ok(())
    }

    /// Detach this operation from its lane and drop all accumulated data.
    ///
    /// Idempotent. Any task blocked in `wait()` is woken; it will observe
    /// the reset state. After invalidation every other method errors with
    /// [`Error::State`].
    pub fn invalidate(&self) {
        if self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }

        let (bus, completion) = {
            let mut st = self.state.lock().expect("scan state poisoned");
            let bus = st.subscription.take();
            let completion = st.completion.take();
            st.reset();
            (bus, completion)
        };

        if let Some(bus) = bus {
            bus.unsubscribe(UPDATE_PROPERTIES.iter().copied());
            self.client.release_bus(bus.object());
        }
        if let Some(completion) = completion {
            completion.fire();
        }

        self.lane.detach_scan(&self.name);
        tracing::debug!(scan = %self.name, "scan invalidated");
    }

    /// Whether `invalidate()` has run.
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_invalidated() {
            return Err(Error::state(format!(
                "scan '{}' has been invalidated",
                self.name
            )));
        }
        Ok(())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CycleState> {
        self.state.lock().expect("scan state poisoned")
    }

    /// Store a reduced grid, but only if it still belongs to the current
    /// cycle. The grid is built with the state lock released, so a restart
    /// or invalidation may have reset the cycle in the meantime; a stale
    /// grid is dropped rather than attached to the new cycle.
    fn store_result(&self, generation: u64, grid: Arc<ScanGrid>) {
        let mut st = self.state();
        if st.generation == generation && !self.is_invalidated() {
            st.result = Some(grid);
        }
    }

    /// Merge one update batch. Runs on the reader task.
    ///
    /// Set-once fields ignore later values; progress and status stay
    /// mutable; telemetry appends and points merge. The update stream is
    /// assumed to carry deltas (distinct, non-overlapping coordinate chunks
    /// per event), not snapshots.
    pub(crate) fn apply_update(&self, event: &UpdateEvent) {
        let mut newly_terminal: Option<(ScanStatus, Arc<Completion>)> = None;
        let mut grid_input: Option<(PointMap, AxisRange, f64)> = None;
        let generation;

        {
            let mut st = self.state.lock().expect("scan state poisoned");
            if self.is_invalidated() {
                return;
            }
            generation = st.generation;

            let was_terminal = st.status.is_terminal();

            // Data fields first, so a terminal status in the same batch sees
            // the batch's own telemetry and points.
            for (name, value) in &event.changes {
                match name.as_str() {
                    "status" => {}
                    "progress" => {
                        if let Some(p) = value.as_f64() {
                            st.progress = p;
                        }
                    }
                    "start-time" => set_once_timestamp(&mut st.started_at, value, name),
                    "stop-time" => set_once_timestamp(&mut st.stopped_at, value, name),
                    "firmware" => {
                        if st.firmware.is_none() {
                            st.firmware = value.as_str().map(str::to_string);
                        }
                    }
                    "expected-samples" => set_once_u64(&mut st.expected_samples, value),
                    "observed-samples" => set_once_u64(&mut st.observed_samples, value),
                    "telemetry" => match TelemetryChunk::from_value(value) {
                        Ok(chunk) => {
                            if let Err(e) = st.telemetry.append(chunk) {
                                tracing::warn!(scan = %self.name, error = %e, "dropping telemetry chunk");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(scan = %self.name, error = %e, "dropping malformed telemetry chunk");
                        }
                    },
                    "points" => {
                        if let Err(e) = st.points.merge_from_value(value) {
                            tracing::warn!(scan = %self.name, error = %e, "dropping malformed scan points");
                        }
                    }
                    other => {
                        tracing::trace!(scan = %self.name, property = other, "unhandled update property");
                    }
                }
            }

            if let Some(value) = event.get("status") {
                if let Some(text) = value.as_str() {
                    st.status_text = Some(text.to_string());
                    if let Some(parsed) = parse_status(text) {
                        st.status = parsed;
                    }
                } else {
                    tracing::warn!(scan = %self.name, "ignoring non-string status");
                }
            }

            // Hardware acceptance is implicit in the first update.
            if st.status == ScanStatus::NotStarted {
                st.status = ScanStatus::InProgress;
            }

            if !was_terminal && st.status.is_terminal() {
                if st.status == ScanStatus::Done {
                    grid_input = Some((st.points.clone(), st.x_range, st.floor));
                }
                if let Some(completion) = st.completion.clone() {
                    newly_terminal = Some((st.status, completion));
                }
            }
        }

        // Everything below runs with the state lock released.
        if let Some((points, x_range, floor)) = grid_input {
            let grid = Arc::new(reduce::reduce(&points, x_range, floor));
            self.store_result(generation, grid);
        }

        if let Some((status, completion)) = newly_terminal {
            tracing::debug!(scan = %self.name, status = ?status, "scan reached terminal state");
            completion.fire();

            let callback = self
                .on_complete
                .lock()
                .expect("scan callback slot poisoned")
                .clone();
            if let Some(callback) = callback {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(status)));
                if outcome.is_err() {
                    tracing::error!(scan = %self.name, "completion callback panicked");
                }
            }
        }
    }
}

fn parse_status(text: &str) -> Option<ScanStatus> {
    let head = text.split(':').next().unwrap_or("").trim();
    match head {
        "in-progress" => Some(ScanStatus::InProgress),
        "done" => Some(ScanStatus::Done),
        "aborted" => Some(ScanStatus::Aborted),
        _ => None,
    }
}

fn set_once_timestamp(slot: &mut Option<Timestamp>, value: &Value, name: &str) {
    if slot.is_some() {
        return;
    }
    match serde_json::from_value::<Timestamp>(value.clone()) {
        Ok(ts) => *slot = Some(ts),
        Err(e) => tracing::warn!(property = name, error = %e, "ignoring malformed timestamp"),
    }
}

fn set_once_u64(slot: &mut Option<u64>, value: &Value) {
    if slot.is_none() {
        *slot = value.as_u64();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        Capability,
        mock::{MockScript, MockServer},
        types::InstrumentKind,
    };

    async fn mock_op() -> (MockServer, Arc<ScanOperation>) {
        let script =
            MockScript::new().reply_return("start-eye-scan", json!({"handle": "h0"}));
        let server = MockServer::start_tcp(script).await.expect("mock server");
        let client = Client::connect(server.endpoint()).await.expect("connect");
        let lane = Lane::new(
            "lane-0",
            "RX lane 0",
            InstrumentKind::LinkTester,
            [Capability::EyeScan],
        );
        let op = Arc::new(ScanOperation::new(
            "Scan_0".to_string(),
            ScanKind::Eye,
            lane,
            client,
        ));
        (server, op)
    }

    #[test]
    fn status_strings_parse_with_optional_reason() {
        assert_eq!(parse_status("in-progress"), Some(ScanStatus::InProgress));
        assert_eq!(parse_status("done"), Some(ScanStatus::Done));
        assert_eq!(
            parse_status("aborted: link training lost"),
            Some(ScanStatus::Aborted)
        );
        assert_eq!(parse_status("warming-up"), None);
    }

    #[tokio::test]
    async fn completion_wait_after_fire_returns_immediately() {
        let c = Completion::default();
        c.fire();
        c.fire(); // second fire is a no-op
        c.wait().await;
    }

    #[tokio::test]
    async fn completion_wakes_a_parked_waiter() {
        let c = Arc::new(Completion::default());
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait().await })
        };
        tokio::task::yield_now().await;
        c.fire();
        waiter.await.expect("waiter completed");
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_a_start_is_in_flight() {
        let (server, op) = mock_op().await;

        // A first start() holds this flag across its await on the remote
        // reply; a concurrent start() must not slip past the status guard.
        op.state().start_pending = true;
        let err = op.start(&HashMap::new()).await.expect_err("must reject");
        assert_eq!(err.kind(), crate::ErrorKind::State);

        op.state().start_pending = false;
        op.start(&HashMap::new()).await.expect("start");
        assert!(op.handle().is_some());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn grid_from_a_stale_cycle_is_discarded() {
        let (server, op) = mock_op().await;

        op.start(&HashMap::new()).await.expect("first start");
        let stale = op.state().generation;

        // Restarting moves the operation to a new cycle.
        op.start(&HashMap::new()).await.expect("second start");
        let current = op.state().generation;
        assert_ne!(stale, current);

        let grid = Arc::new(reduce::reduce(
            &PointMap::from_observations([(0, 0, 1e-6, 1, 10)]),
            AxisRange {
                min: -0.5,
                max: 0.5,
            },
            1e-12,
        ));

        // A grid finished on the dispatch side after the restart belongs to
        // the old cycle and must not surface on the new one.
        op.store_result(stale, grid.clone());
        assert!(op.result().is_none());

        op.store_result(current, grid);
        assert!(op.result().is_some());

        op.invalidate();
        assert!(op.result().is_none());

        server.shutdown().await;
    }
}
