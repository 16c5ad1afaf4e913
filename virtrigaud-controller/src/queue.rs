//! Per-kind work queue.
//!
//! Keys deduplicate while queued, and a key handed to a worker is not
//! handed to another until the first marks it done: reconciliations for a
//! single object are strictly serial. A key re-added while processing is
//! parked in a dirty set and re-queued on done.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

use virtrigaud_api::ObjectKey;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    shutdown: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Deduplicating work queue with per-key serialisation.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue a key. Duplicate adds collapse; adds during processing are
    /// parked and re-queued when the current reconciliation finishes.
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        if state.processing.contains(&key) {
            trace!(key = %key, "key busy, parking in dirty set");
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Enqueue a key after a delay. A zero delay enqueues immediately.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key. Returns None once the queue is shut down and
    /// drained.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Mark a key done; re-queues it when adds arrived while processing.
    pub fn done(&self, key: &ObjectKey) {
        let requeue = {
            let mut state = self.inner.state.lock().unwrap();
            state.processing.remove(key);
            state.dirty.take(key).is_some() && !state.shutdown
        };
        if requeue {
            self.add(key.clone());
        }
    }

    pub fn shutdown(&self) {
        self.inner.state.lock().unwrap().shutdown = true;
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
