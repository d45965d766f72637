//! Kestrel work queue: keys in, keys out, never the same key twice at once.
//!
//! Adding a key that is already pending is a no-op. Adding a key that a worker
//! is processing marks it dirty; it is handed out again after `done`.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use kestrel_core::Key;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::trace;

mod backoff;

pub use backoff::RetryPolicy;

#[derive(Default)]
struct State {
    queue: VecDeque<Key>,
    dirty: FxHashSet<Key>,
    processing: FxHashSet<Key>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    retry: RetryPolicy,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self { name: name.into(), state: Mutex::new(State::default()), notify: Notify::new(), retry })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, key: Key) {
        let depth = {
            let mut st = self.state.lock();
            if st.shutting_down || !st.dirty.insert(key.clone()) {
                return;
            }
            if st.processing.contains(&key) {
                trace!(queue = %self.name, key = %key, "key busy; marked dirty");
                return;
            }
            st.queue.push_back(key);
            st.queue.len()
        };
        metrics::gauge!("controller_queue_depth", depth as f64, "controller" => self.name.clone());
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: Key, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
        });
    }

    /// Requeue a failed key after its backoff. Returns the delay applied.
    pub fn add_rate_limited(self: &Arc<Self>, key: Key) -> Duration {
        let delay = self.retry.next_delay(&key);
        self.add_after(key, delay);
        delay
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &Key) {
        self.retry.forget(key);
    }

    pub fn num_requeues(&self, key: &Key) -> u32 {
        self.retry.failures(key)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<Key> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed, handing it out again if it was re-added meanwhile.
    pub fn done(&self, key: &Key) {
        let requeued = {
            let mut st = self.state.lock();
            st.processing.remove(key);
            if st.dirty.contains(key) && !st.shutting_down {
                st.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().processing.len()
    }
}
