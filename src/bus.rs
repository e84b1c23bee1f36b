//! Property-change notification bus.
//!
//! One bus exists per connected remote object (see [`Client::bus`]). It maps
//! property names to subscriptions, and fans a single coalesced
//! "properties changed" message from the reader task out into one
//! [`UpdateEvent`] per interested subscription.
//!
//! Delivery discipline: the bus mutex guards only the subscription maps. It
//! is released before any listener runs, so a listener may subscribe or
//! unsubscribe without deadlocking, and a panicking listener never poisons
//! delivery to the others.
//!
//! [`Client::bus`]: crate::Client::bus

use std::{
    collections::{HashMap, HashSet, VecDeque},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex},
};

use serde_json::Value;

use crate::{
    error::{Error, Result},
    types::{ObjectId, Timestamp},
};

/// Name of a remote-observable property.
pub type PropertyName = String;

/// A listener invoked on the dispatch (reader) task with the subscription's
/// queue handle after a new batch has been pushed.
pub type Listener = Arc<dyn Fn(&UpdateQueue) + Send + Sync>;

/// Opaque id of one subscription on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// One coalesced batch of property changes, filtered down to the names a
/// subscription asked for.
///
/// Names within one event are unique; all changes share one capture
/// timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    /// Changed names and their new values.
    pub changes: Vec<(PropertyName, Value)>,

    /// Capture timestamp shared by every change in the batch.
    pub timestamp: Timestamp,
}

impl UpdateEvent {
    /// Look up the value for a property name in this batch.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.changes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// FIFO queue of update batches for one subscription.
///
/// Each subscription owns its queue, so a consumer that drains slowly never
/// blocks delivery to other subscriptions.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    inner: Mutex<VecDeque<UpdateEvent>>,
}

impl UpdateQueue {
    /// Pop the oldest batch, if any.
    #[must_use]
    pub fn pop(&self) -> Option<UpdateEvent> {
        self.inner.lock().expect("update queue poisoned").pop_front()
    }

    /// Drain every queued batch, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<UpdateEvent> {
        self.inner
            .lock()
            .expect("update queue poisoned")
            .drain(..)
            .collect()
    }

    /// Number of queued batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("update queue poisoned").len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, event: UpdateEvent) {
        self.inner
            .lock()
            .expect("update queue poisoned")
            .push_back(event);
    }
}

struct SubEntry {
    names: HashSet<PropertyName>,
    listeners: Vec<Listener>,
    queue: Arc<UpdateQueue>,
}

#[derive(Default)]
struct BusState {
    by_name: HashMap<PropertyName, HashSet<SubscriptionId>>,
    subs: HashMap<SubscriptionId, SubEntry>,
    next_id: u64,
}

/// Per-object property-change bus.
pub struct PropertyChangeBus {
    object: ObjectId,
    state: Mutex<BusState>,
}

impl std::fmt::Debug for PropertyChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyChangeBus")
            .field("object", &self.object)
            .finish()
    }
}

impl PropertyChangeBus {
    pub(crate) fn new(object: ObjectId) -> Self {
        Self {
            object,
            state: Mutex::new(BusState::default()),
        }
    }

    /// The remote object this bus belongs to.
    #[must_use]
    pub fn object(&self) -> &ObjectId {
        &self.object
    }

    /// Register interest in a set of property names.
    ///
    /// Every listener is invoked (with the subscription's queue handle) each
    /// time a batch containing at least one of the names arrives. The name
    /// set must be non-empty.
    pub fn subscribe<I, S>(&self, names: I, listeners: Vec<Listener>) -> Result<SubscriptionId>
    where
        I: IntoIterator<Item = S>,
        S: Into<PropertyName>,
    {
        let names: HashSet<PropertyName> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(Error::state("subscribe requires at least one property name"));
        }

        let mut state = self.state.lock().expect("bus state poisoned");
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;

        for name in &names {
            state.by_name.entry(name.clone()).or_default().insert(id);
        }
        state.subs.insert(
            id,
            SubEntry {
                names,
                listeners,
                queue: Arc::new(UpdateQueue::default()),
            },
        );

        Ok(id)
    }

    /// Stop tracking the given property names.
    ///
    /// Only the named properties are removed; a subscription whose last name
    /// is removed is retired entirely.
    pub fn unsubscribe<'a, I>(&self, names: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut state = self.state.lock().expect("bus state poisoned");
        for name in names {
            let Some(ids) = state.by_name.remove(name) else {
                continue;
            };
            for id in ids {
                let retire = match state.subs.get_mut(&id) {
                    Some(entry) => {
                        entry.names.remove(name);
                        entry.names.is_empty()
                    }
                    None => false,
                };
                if retire {
                    state.subs.remove(&id);
                }
            }
        }
    }

    /// The set of names with at least one live subscription.
    #[must_use]
    pub fn active_names(&self) -> HashSet<PropertyName> {
        let state = self.state.lock().expect("bus state poisoned");
        state.by_name.keys().cloned().collect()
    }

    /// The queue handle for a subscription, if it is still live.
    #[must_use]
    pub fn queue(&self, id: SubscriptionId) -> Option<Arc<UpdateQueue>> {
        let state = self.state.lock().expect("bus state poisoned");
        state.subs.get(&id).map(|e| e.queue.clone())
    }

    /// Fan one coalesced change message out to interested subscriptions.
    ///
    /// Invoked by the reader task for every notification routed to this
    /// object. Builds one [`UpdateEvent`] per subscription containing only
    /// the names that subscription asked for, pushes it onto the
    /// subscription's queue, then invokes the listeners with the bus lock
    /// released. A panicking listener is logged and does not stop delivery
    /// to the others.
    pub(crate) fn dispatch(&self, changed: &[(PropertyName, Value)], timestamp: Timestamp) {
        // Group the changed names by subscription id under the lock, but
        // keep only cheap clones; all listener work happens after unlock.
        let mut deliveries: Vec<(Arc<UpdateQueue>, Vec<Listener>, UpdateEvent)> = Vec::new();
        {
            let state = self.state.lock().expect("bus state poisoned");

            let mut per_sub: HashMap<SubscriptionId, Vec<(PropertyName, Value)>> = HashMap::new();
            for (name, value) in changed {
                let Some(ids) = state.by_name.get(name) else {
                    continue;
                };
                for id in ids {
                    per_sub
                        .entry(*id)
                        .or_default()
                        .push((name.clone(), value.clone()));
                }
            }

            for (id, changes) in per_sub {
                let Some(entry) = state.subs.get(&id) else {
                    continue;
                };
                deliveries.push((
                    entry.queue.clone(),
                    entry.listeners.clone(),
                    UpdateEvent { changes, timestamp },
                ));
            }
        }

        for (queue, listeners, event) in deliveries {
            queue.push(event);
            for listener in listeners {
                let outcome = catch_unwind(AssertUnwindSafe(|| listener(&queue)));
                if outcome.is_err() {
                    tracing::error!(
                        object = %self.object,
                        "property-change listener panicked; continuing delivery"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn bus() -> PropertyChangeBus {
        PropertyChangeBus::new(ObjectId::from("lane-0"))
    }

    fn changes(pairs: &[(&str, i64)]) -> Vec<(PropertyName, Value)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn listener_sees_exactly_its_names() {
        let bus = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let listener: Listener = Arc::new(move |q: &UpdateQueue| {
            for ev in q.drain() {
                let mut names: Vec<_> = ev.changes.iter().map(|(n, _)| n.clone()).collect();
                names.sort();
                seen2.lock().unwrap().push(names);
            }
        });

        bus.subscribe(["progress", "status"], vec![listener]).unwrap();
        bus.dispatch(
            &changes(&[("progress", 30), ("status", 1), ("unrelated", 9)]),
            Timestamp::zero(),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec!["progress".to_string(), "status".to_string()]);
    }

    #[test]
    fn no_event_when_no_subscribed_name_changed() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let listener: Listener = Arc::new(move |_q: &UpdateQueue| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.subscribe(["status"], vec![listener]).unwrap();
        bus.dispatch(&changes(&[("progress", 30)]), Timestamp::zero());

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_retires_subscription_when_last_name_removed() {
        let bus = bus();
        let id = bus
            .subscribe(["a", "b"], Vec::new())
            .expect("subscribe");

        bus.unsubscribe(["a"]);
        assert_eq!(bus.active_names(), HashSet::from(["b".to_string()]));
        assert!(bus.queue(id).is_some());

        bus.unsubscribe(["b"]);
        assert!(bus.active_names().is_empty());
        assert!(bus.queue(id).is_none());
    }

    #[test]
    fn panicking_listener_does_not_stop_other_listeners() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        let bad: Listener = Arc::new(|_q: &UpdateQueue| panic!("listener bug"));
        let good: Listener = Arc::new(move |_q: &UpdateQueue| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.subscribe(["status"], vec![bad, good]).unwrap();
        bus.dispatch(&changes(&[("status", 1)]), Timestamp::zero());
        bus.dispatch(&changes(&[("status", 2)]), Timestamp::zero());

        // The healthy listener saw both batches.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn queues_are_per_subscription() {
        let bus = bus();
        let a = bus.subscribe(["status"], Vec::new()).unwrap();
        let b = bus.subscribe(["status"], Vec::new()).unwrap();

        bus.dispatch(&changes(&[("status", 1)]), Timestamp::zero());

        let qa = bus.queue(a).unwrap();
        let qb = bus.queue(b).unwrap();
        assert_eq!(qa.len(), 1);
        assert_eq!(qb.len(), 1);

        // Draining one consumer leaves the other untouched.
        assert_eq!(qa.drain().len(), 1);
        assert_eq!(qb.len(), 1);
    }

    #[test]
    fn empty_name_set_is_rejected() {
        let bus = bus();
        let err = bus
            .subscribe(std::iter::empty::<String>(), Vec::new())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::State);
    }
}
