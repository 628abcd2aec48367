//! Callback fan-out with explicit subscription handles.
//!
//! `subscribe` hands back an opaque [`SubscriptionId`]; `unsubscribe(id)` removes
//! exactly that registration. Notification runs every callback synchronously on the
//! notifying thread. A panicking callback is logged and skipped so the remaining
//! callbacks (and the notifier) carry on.

use crate::error::panic_message;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Set of callbacks receiving `&T` notifications.
pub struct SubscriberSet<T: ?Sized> {
    owner: String,
    next_id: AtomicU64,
    callbacks: RwLock<BTreeMap<SubscriptionId, Callback<T>>>,
}

impl<T: ?Sized> std::fmt::Debug for SubscriberSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberSet")
            .field("owner", &self.owner)
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<T: ?Sized> SubscriberSet<T> {
    /// Create an empty set. `owner` is used to attribute failures in logs.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            next_id: AtomicU64::new(0),
            callbacks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a callback.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().insert(id, Arc::new(callback));
        id
    }

    /// Remove a callback. Returns `false` if `id` was not (or no longer) registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks.write().remove(&id).is_some()
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    /// True if no callbacks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback with `value`.
    ///
    /// The callback list is snapshotted first, so callbacks may subscribe or
    /// unsubscribe without deadlocking.
    pub fn notify(&self, value: &T) {
        let callbacks: Vec<(SubscriptionId, Callback<T>)> = self
            .callbacks
            .read()
            .iter()
            .map(|(id, cb)| (*id, cb.clone()))
            .collect();

        for (id, callback) in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
                tracing::warn!(
                    owner = %self.owner,
                    subscription = %id,
                    panic = %panic_message(payload.as_ref()),
                    "Subscriber callback panicked; continuing with remaining subscribers"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn unsubscribe_removes_only_that_callback() {
        let set = SubscriberSet::<u32>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let a = {
            let hits = hits.clone();
            set.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _b = {
            let hits = hits.clone();
            set.subscribe(move |_| {
                hits.fetch_add(10, Ordering::SeqCst);
            })
        };

        set.notify(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        assert!(set.unsubscribe(a));
        assert!(!set.unsubscribe(a));
        set.notify(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn panicking_callback_does_not_stop_others() {
        let set = SubscriberSet::<u32>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        set.subscribe(|_| panic!("subscriber failure"));
        {
            let hits = hits.clone();
            set.subscribe(move |v| {
                hits.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }

        set.notify(&5);
        set.notify(&5);
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }
}
