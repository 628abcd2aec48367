//! Virtual instruments: sequenced, observable value cells.
//!
//! A [`VirtualInstrument`] is the uniform representation of one measured or
//! commanded quantity. Translators push values in with
//! [`update_state`](VirtualInstrument::update_state); everything else observes it:
//!
//! - [`get_latest_state`](VirtualInstrument::get_latest_state) reads the last commit
//! - [`wait_for`](VirtualInstrument::wait_for) blocks until a predicate holds
//! - [`subscribe`](VirtualInstrument::subscribe) registers a synchronous callback
//! - [`as_queue`](VirtualInstrument::as_queue) gives an ordered, drop-oldest consumer queue
//! - [`as_iterator`](VirtualInstrument::as_iterator) yields the latest state lazily
//!
//! # Ordering
//!
//! Sequence numbers start at 0 and increase by exactly one per commit, even with
//! concurrent producers, because the commit is serialized by the instrument lock.
//! The lock is released before subscribers and queues are fed, so a slow
//! subscriber delays its producer but never blocks readers.

mod queue;

pub use queue::StateQueue;

use crate::cancel::CancellationToken;
use crate::error::{BenchError, BenchResult};
use crate::subscription::{SubscriberSet, SubscriptionId};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use queue::QueueShared;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Slice used by the lossy iterator between stop-signal checks.
const ITERATOR_POLL: Duration = Duration::from_millis(100);

/// Descriptive metadata, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualInstrumentMetadata {
    /// Registry key
    pub uid: String,
    /// Human readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Physical unit (e.g. "mbar")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl VirtualInstrumentMetadata {
    /// Metadata carrying only a uid.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: None,
            unit: None,
            description: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// One committed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualInstrumentState<V> {
    /// The value
    pub value: V,
    /// Position in this instrument's update stream, starting at 0
    pub sequence: u64,
    /// Commit time
    pub timestamp: DateTime<Utc>,
}

/// Callback pointing down to the physical layer.
pub type CommandCallback<V> = Arc<dyn Fn(&V) -> anyhow::Result<()> + Send + Sync>;

struct Inner<V> {
    state: Option<VirtualInstrumentState<V>>,
    next_sequence: u64,
    history: VecDeque<VirtualInstrumentState<V>>,
}

/// Thread-safe, sequenced, observable value cell.
pub struct VirtualInstrument<V> {
    metadata: VirtualInstrumentMetadata,
    inner: Mutex<Inner<V>>,
    changed: Condvar,
    subscribers: SubscriberSet<VirtualInstrumentState<V>>,
    queues: Mutex<Vec<Weak<QueueShared<VirtualInstrumentState<V>>>>>,
    command: Option<CommandCallback<V>>,
    history_capacity: usize,
}

impl<V> std::fmt::Debug for VirtualInstrument<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualInstrument")
            .field("uid", &self.metadata.uid)
            .field("commandable", &self.command.is_some())
            .field("history_capacity", &self.history_capacity)
            .finish()
    }
}

impl<V> VirtualInstrument<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an instrument with no state, no command path and no history.
    pub fn new(metadata: VirtualInstrumentMetadata) -> Self {
        let subscribers = SubscriberSet::new(metadata.uid.clone());
        Self {
            metadata,
            inner: Mutex::new(Inner {
                state: None,
                next_sequence: 0,
                history: VecDeque::new(),
            }),
            changed: Condvar::new(),
            subscribers,
            queues: Mutex::new(Vec::new()),
            command: None,
            history_capacity: 0,
        }
    }

    /// Attach the command path used by [`command`](Self::command).
    pub fn with_command<F>(mut self, callback: F) -> Self
    where
        F: Fn(&V) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.command = Some(Arc::new(callback));
        self
    }

    /// Retain the last `capacity` states for [`states_since`](Self::states_since).
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Metadata given at construction.
    pub fn metadata(&self) -> &VirtualInstrumentMetadata {
        &self.metadata
    }

    /// Shorthand for `metadata().uid`.
    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    /// Commit a new value and distribute it.
    ///
    /// Every open queue is offered the state without blocking while the commit
    /// lock is held, so queues see sequences in order even with several
    /// producers. Subscriber callbacks run on the calling thread after the lock
    /// is released; with concurrent producers they may observe states out of
    /// sequence order. A panicking callback is logged and skipped.
    pub fn update_state(&self, value: V) -> VirtualInstrumentState<V> {
        let state = {
            let mut inner = self.inner.lock();
            let state = VirtualInstrumentState {
                value,
                sequence: inner.next_sequence,
                timestamp: Utc::now(),
            };
            inner.next_sequence += 1;
            if self.history_capacity > 0 {
                while inner.history.len() >= self.history_capacity {
                    inner.history.pop_front();
                }
                inner.history.push_back(state.clone());
            }
            inner.state = Some(state.clone());
            self.changed.notify_all();

            self.queues.lock().retain(|queue| match queue.upgrade() {
                Some(queue) => {
                    queue.offer(state.clone());
                    true
                }
                None => false,
            });
            state
        };

        self.subscribers.notify(&state);
        state
    }

    /// The last committed state. Fails with `Uninitialized` before the first update.
    pub fn get_latest_state(&self) -> BenchResult<VirtualInstrumentState<V>> {
        self.inner
            .lock()
            .state
            .clone()
            .ok_or_else(|| BenchError::Uninitialized(self.metadata.uid.clone()))
    }

    /// The last committed value.
    pub fn value(&self) -> BenchResult<V> {
        self.get_latest_state().map(|state| state.value)
    }

    /// Block until `predicate` holds for the current state and return that state.
    ///
    /// The predicate is evaluated under the instrument lock, once immediately and
    /// again after every commit; it must not call back into this instrument. An
    /// instrument without state never satisfies it. With `timeout` set, fails with
    /// `Timeout` once the deadline passes.
    pub fn wait_for<P>(
        &self,
        predicate: P,
        timeout: Option<Duration>,
    ) -> BenchResult<VirtualInstrumentState<V>>
    where
        P: Fn(&VirtualInstrumentState<V>) -> bool,
    {
        // A timeout past the representable range waits without a deadline
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t).map(|d| (t, d)));
        let mut inner = self.inner.lock();
        loop {
            if let Some(state) = inner.state.as_ref() {
                if predicate(state) {
                    return Ok(state.clone());
                }
            }
            match deadline {
                None => self.changed.wait(&mut inner),
                Some((timeout, deadline)) => {
                    if self.changed.wait_until(&mut inner, deadline).timed_out() {
                        return match inner.state.as_ref() {
                            Some(state) if predicate(state) => Ok(state.clone()),
                            _ => Err(BenchError::Timeout(timeout)),
                        };
                    }
                }
            }
        }
    }

    /// Register a callback invoked with every new state.
    ///
    /// Each call is a separate registration, even for the same closure.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&VirtualInstrumentState<V>) + Send + Sync + 'static,
    {
        let id = self.subscribers.subscribe(callback);
        debug!(instrument = %self.metadata.uid, subscription = %id, "Subscribed");
        id
    }

    /// Remove a subscription. Returns `false` for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Number of active subscriber callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Open a consumer queue receiving every subsequent state.
    ///
    /// `max_size == 0` is unbounded. Otherwise the oldest entry is evicted when
    /// the queue is full.
    pub fn as_queue(&self, max_size: usize) -> StateQueue<VirtualInstrumentState<V>> {
        let shared = Arc::new(QueueShared::new(max_size));
        self.queues.lock().push(Arc::downgrade(&shared));
        StateQueue::new(shared)
    }

    /// Lazily yield states committed after this call.
    ///
    /// The iterator is lossy: each `next()` returns the latest state newer than
    /// the one it returned before, skipping any in between. It ends once `stop`
    /// is cancelled; without a stop token it never ends.
    pub fn as_iterator(&self, stop: Option<CancellationToken>) -> StateIter<'_, V> {
        let last_sequence = self.inner.lock().state.as_ref().map(|s| s.sequence);
        StateIter {
            instrument: self,
            stop,
            last_sequence,
        }
    }

    /// Retained states with `sequence >= from`, oldest first.
    pub fn states_since(&self, from: u64) -> Vec<VirtualInstrumentState<V>> {
        self.inner
            .lock()
            .history
            .iter()
            .filter(|state| state.sequence >= from)
            .cloned()
            .collect()
    }

    /// Whether a command path is attached.
    pub fn is_commandable(&self) -> bool {
        self.command.is_some()
    }

    /// Forward `value` to the command path. Returns whether it was accepted.
    ///
    /// Commands never fail the caller: a missing command path or a failing
    /// physical call is logged at error level.
    pub fn command(&self, value: &V) -> bool {
        let Some(callback) = self.command.as_ref() else {
            error!(
                instrument = %self.metadata.uid,
                "Command ignored: instrument has no command path"
            );
            return false;
        };
        match callback(value) {
            Ok(()) => true,
            Err(e) => {
                error!(instrument = %self.metadata.uid, error = %e, "Command failed");
                false
            }
        }
    }
}

/// Lossy iterator returned by [`VirtualInstrument::as_iterator`].
pub struct StateIter<'a, V> {
    instrument: &'a VirtualInstrument<V>,
    stop: Option<CancellationToken>,
    last_sequence: Option<u64>,
}

impl<V> Iterator for StateIter<'_, V>
where
    V: Clone + Send + Sync + 'static,
{
    type Item = VirtualInstrumentState<V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.stop.as_ref().is_some_and(|s| s.is_cancelled()) {
                return None;
            }
            let last = self.last_sequence;
            let newer = |state: &VirtualInstrumentState<V>| last.map_or(true, |l| state.sequence > l);
            let timeout = self.stop.as_ref().map(|_| ITERATOR_POLL);
            match self.instrument.wait_for(newer, timeout) {
                Ok(state) => {
                    self.last_sequence = Some(state.sequence);
                    return Some(state);
                }
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn instrument() -> VirtualInstrument<i64> {
        VirtualInstrument::new(VirtualInstrumentMetadata::new("pressure").with_unit("mbar"))
    }

    #[test]
    fn read_before_first_update_fails() {
        let vi = instrument();
        assert!(matches!(
            vi.get_latest_state(),
            Err(BenchError::Uninitialized(ref uid)) if uid == "pressure"
        ));
    }

    #[test]
    fn sequence_starts_at_zero() {
        let vi = instrument();
        assert_eq!(vi.update_state(10).sequence, 0);
        assert_eq!(vi.update_state(11).sequence, 1);
        let latest = vi.get_latest_state().unwrap();
        assert_eq!(latest.sequence, 1);
        assert_eq!(latest.value, 11);
    }

    #[test]
    fn history_is_bounded() {
        let vi = instrument().with_history_capacity(3);
        for i in 0..6 {
            vi.update_state(i);
        }
        let seqs: Vec<u64> = vi.states_since(0).iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(vi.states_since(5).len(), 1);
        assert!(vi.states_since(6).is_empty());
    }

    #[test]
    #[traced_test]
    fn command_without_path_logs_error() {
        let vi = instrument();
        assert!(!vi.is_commandable());
        assert!(!vi.command(&1));
        assert!(logs_contain("instrument has no command path"));
    }

    #[test]
    #[traced_test]
    fn failing_command_is_logged_not_raised() {
        let vi = instrument().with_command(|_| Err(anyhow::anyhow!("bus offline")));
        assert!(!vi.command(&3));
        assert!(logs_contain("bus offline"));
    }

    #[test]
    fn command_forwards_value() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let vi = {
            let seen = seen.clone();
            instrument().with_command(move |v| {
                seen.lock().push(*v);
                Ok(())
            })
        };
        assert!(vi.command(&5));
        assert_eq!(*seen.lock(), vec![5]);
    }

    #[test]
    fn dropped_queue_is_pruned() {
        let vi = instrument();
        let queue = vi.as_queue(2);
        vi.update_state(1);
        drop(queue);
        vi.update_state(2);
        assert!(vi.queues.lock().is_empty());
    }
}
