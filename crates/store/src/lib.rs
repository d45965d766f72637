//! Kestrel store: the controller's local, eventually consistent object cache.
//!
//! A single stream-consuming task mutates the cache; workers and listers read
//! it concurrently. Full listings are served from a frozen snapshot that is
//! rebuilt lazily after the next mutation, so iteration never observes a
//! concurrent write.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use kestrel_core::{EventKind, Key, Object, WatchEvent};
use kube::ResourceExt;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::{debug, trace};

mod lister;

pub use lister::Lister;

/// Frozen view of every cached object at one epoch, ordered by key.
pub struct Snapshot<K> {
    pub epoch: u64,
    pub items: Vec<Arc<K>>,
}

struct Inner<K> {
    epoch: u64,
    items: FxHashMap<Key, Arc<K>>,
    by_scope: FxHashMap<String, FxHashSet<Key>>,
}

impl<K: Object> Inner<K> {
    fn insert(&mut self, key: Key, obj: K) {
        if let Some(ns) = key.scope() {
            self.by_scope.entry(ns.to_string()).or_default().insert(key.clone());
        }
        self.items.insert(key, Arc::new(obj));
    }

    fn remove(&mut self, key: &Key) -> Option<Arc<K>> {
        if let Some(ns) = key.scope() {
            if let Some(set) = self.by_scope.get_mut(ns) {
                set.remove(key);
                if set.is_empty() {
                    self.by_scope.remove(ns);
                }
            }
        }
        self.items.remove(key)
    }

    fn freeze(&self) -> Snapshot<K> {
        let mut keyed: Vec<(&Key, &Arc<K>)> = self.items.iter().collect();
        keyed.sort_unstable_by(|a, b| a.0.cmp(b.0));
        Snapshot { epoch: self.epoch, items: keyed.into_iter().map(|(_, o)| Arc::clone(o)).collect() }
    }
}

/// Keyed store of the latest observed state per object, indexed by scope.
pub struct Cache<K> {
    inner: RwLock<Inner<K>>,
    frozen: ArcSwapOption<Snapshot<K>>,
    epoch_tx: watch::Sender<u64>,
    synced_tx: watch::Sender<bool>,
}

impl<K: Object> Default for Cache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Object> Cache<K> {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let (synced_tx, _) = watch::channel(false);
        Self {
            inner: RwLock::new(Inner { epoch: 0, items: FxHashMap::default(), by_scope: FxHashMap::default() }),
            frozen: ArcSwapOption::const_empty(),
            epoch_tx,
            synced_tx,
        }
    }

    pub fn get(&self, key: &Key) -> Option<Arc<K>> {
        self.inner.read().items.get(key).cloned()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.inner.read().items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch_tx.borrow()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.inner.read().items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Apply one observed change. Returns the key it touched.
    pub fn on_event(&self, kind: EventKind, obj: K) -> Key {
        let key = Key::of(&obj);
        self.mutate(|inner| match kind {
            EventKind::Added | EventKind::Modified => {
                trace!(key = %key, rv = ?obj.resource_version(), "cache upsert");
                inner.insert(key.clone(), obj);
            }
            EventKind::Deleted => {
                trace!(key = %key, "cache delete");
                inner.remove(&key);
            }
        });
        key
    }

    /// Apply a watch event; bookmarks carry no object and are ignored.
    pub fn apply(&self, ev: WatchEvent<K>) -> Option<Key> {
        match ev {
            WatchEvent::Added(o) => Some(self.on_event(EventKind::Added, o)),
            WatchEvent::Modified(o) => Some(self.on_event(EventKind::Modified, o)),
            WatchEvent::Deleted(o) => Some(self.on_event(EventKind::Deleted, o)),
            WatchEvent::Bookmark(_) => None,
        }
    }

    /// Replace the whole content with a fresh listing (resync).
    ///
    /// Returns the keys that differ from what was cached: new objects,
    /// objects whose resource version moved, and objects no longer listed.
    pub fn replace(&self, items: Vec<K>) -> Vec<Key> {
        let mut changed = Vec::new();
        self.mutate(|inner| {
            let mut listed: FxHashSet<Key> = FxHashSet::default();
            for obj in items {
                let key = Key::of(&obj);
                let unchanged = inner
                    .items
                    .get(&key)
                    .map(|cur| cur.resource_version().is_some() && cur.resource_version() == obj.resource_version())
                    .unwrap_or(false);
                if !unchanged {
                    changed.push(key.clone());
                }
                listed.insert(key.clone());
                inner.insert(key, obj);
            }
            let stale: Vec<Key> = inner.items.keys().filter(|k| !listed.contains(*k)).cloned().collect();
            for key in stale {
                inner.remove(&key);
                changed.push(key);
            }
        });
        changed.sort_unstable();
        debug!(changed = changed.len(), total = self.len(), "cache replaced from listing");
        self.synced_tx.send_replace(true);
        changed
    }

    pub fn has_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }

    /// Resolve once the first full listing has been applied.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail while borrowed.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Current frozen snapshot, rebuilt if a mutation invalidated it.
    pub fn snapshot(&self) -> Arc<Snapshot<K>> {
        let inner = self.inner.read();
        if let Some(snap) = self.frozen.load_full() {
            if snap.epoch == inner.epoch {
                return snap;
            }
        }
        let snap = Arc::new(inner.freeze());
        self.frozen.store(Some(Arc::clone(&snap)));
        snap
    }

    /// Objects in `scope` (all scopes when `None`) that satisfy `pred`.
    ///
    /// The listing is taken at call time; it can be iterated any number of
    /// times and is unaffected by later cache writes.
    pub fn list<F>(&self, scope: Option<&str>, pred: F) -> Listing<K, F>
    where
        F: Fn(&K) -> bool,
    {
        let items = match scope {
            None => self.snapshot(),
            Some(ns) => {
                let inner = self.inner.read();
                let mut keys: Vec<&Key> = inner.by_scope.get(ns).map(|s| s.iter().collect()).unwrap_or_default();
                keys.sort_unstable();
                let items = keys.into_iter().filter_map(|k| inner.items.get(k).cloned()).collect();
                Arc::new(Snapshot { epoch: inner.epoch, items })
            }
        };
        Listing { snap: items, pred }
    }

    fn mutate(&self, f: impl FnOnce(&mut Inner<K>)) {
        let (epoch, len) = {
            let mut inner = self.inner.write();
            f(&mut inner);
            inner.epoch = inner.epoch.saturating_add(1);
            self.frozen.store(None);
            (inner.epoch, inner.items.len())
        };
        metrics::gauge!("cache_objects", len as f64);
        self.epoch_tx.send_replace(epoch);
    }
}

/// Lazily filtered, restartable view over a cache snapshot.
pub struct Listing<K, F> {
    snap: Arc<Snapshot<K>>,
    pred: F,
}

impl<K, F> Listing<K, F>
where
    F: Fn(&K) -> bool,
{
    pub fn epoch(&self) -> u64 {
        self.snap.epoch
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<K>> + '_ {
        self.snap.items.iter().filter(move |o| (self.pred)(&***o))
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn to_vec(&self) -> Vec<Arc<K>> {
        self.iter().cloned().collect()
    }
}
