//! Consumer queues fed by [`VirtualInstrument::update_state`](super::VirtualInstrument::update_state).
//!
//! The producer side never blocks: when a bounded queue is full the oldest entry
//! is evicted and counted as dropped.

use crate::error::{BenchError, BenchResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct QueueShared<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    max_size: usize,
    dropped: AtomicU64,
}

impl<T> QueueShared<T> {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            max_size,
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking put with drop-oldest overflow.
    pub(crate) fn offer(&self, item: T) {
        let mut items = self.items.lock();
        if self.max_size > 0 {
            while items.len() >= self.max_size {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        items.push_back(item);
        drop(items);
        self.available.notify_one();
    }
}

/// Receiving end of a consumer queue.
///
/// Dropping the handle closes the queue; the instrument stops offering to it on
/// the next update.
pub struct StateQueue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> std::fmt::Debug for StateQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateQueue")
            .field("len", &self.len())
            .field("max_size", &self.shared.max_size)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl<T> StateQueue<T> {
    pub(crate) fn new(shared: Arc<QueueShared<T>>) -> Self {
        Self { shared }
    }

    /// Take the oldest entry, blocking until one arrives.
    ///
    /// `None` waits indefinitely; otherwise fails with `Timeout` once the deadline passes.
    pub fn pop(&self, timeout: Option<Duration>) -> BenchResult<T> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t).map(|d| (t, d)));
        let mut items = self.shared.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Ok(item);
            }
            match deadline {
                None => self.shared.available.wait(&mut items),
                Some((timeout, deadline)) => {
                    if self
                        .shared
                        .available
                        .wait_until(&mut items, deadline)
                        .timed_out()
                        && items.is_empty()
                    {
                        return Err(BenchError::Timeout(timeout));
                    }
                }
            }
        }
    }

    /// Take the oldest entry if one is queued.
    pub fn try_pop(&self) -> Option<T> {
        self.shared.items.lock().pop_front()
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.shared.items.lock().drain(..).collect()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.shared.items.lock().len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity, 0 meaning unbounded.
    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    /// Entries evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max_size: usize) -> (Arc<QueueShared<u32>>, StateQueue<u32>) {
        let shared = Arc::new(QueueShared::new(max_size));
        (shared.clone(), StateQueue::new(shared))
    }

    #[test]
    fn bounded_queue_keeps_newest() {
        let (producer, consumer) = queue(3);
        for i in 0..10 {
            producer.offer(i);
        }
        assert_eq!(consumer.drain(), vec![7, 8, 9]);
        assert_eq!(consumer.dropped(), 7);
    }

    #[test]
    fn zero_means_unbounded() {
        let (producer, consumer) = queue(0);
        for i in 0..1000 {
            producer.offer(i);
        }
        assert_eq!(consumer.len(), 1000);
        assert_eq!(consumer.dropped(), 0);
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let (_producer, consumer) = queue(1);
        let err = consumer.pop(Some(Duration::from_millis(30))).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn pop_wakes_on_offer() {
        let (producer, consumer) = queue(4);
        let handle = std::thread::spawn(move || consumer.pop(Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(20));
        producer.offer(42);
        assert_eq!(handle.join().unwrap().unwrap(), 42);
    }
}
