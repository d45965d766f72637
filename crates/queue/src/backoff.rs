use std::time::Duration;

use kestrel_core::Key;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<Key, u32>>,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }

    /// Record one more failure for `key` and return how long to wait before retrying.
    pub fn next_delay(&self, key: &Key) -> Duration {
        let mut failures = self.failures.lock();
        let n = failures.entry(key.clone()).or_insert(0);
        let exp = (*n).min(31);
        *n = n.saturating_add(1);
        self.base.checked_mul(1u32 << exp).map(|d| d.min(self.max)).unwrap_or(self.max)
    }

    pub fn failures(&self, key: &Key) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    pub fn forget(&self, key: &Key) {
        self.failures.lock().remove(key);
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}
