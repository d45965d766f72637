//! In-process backing store with list/watch, optimistic concurrency and
//! finalizer-gated deletion. Drives the controller in tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::{self, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kestrel_core::{BackingStore, Error, Key, ListFilter, Object, ObjectList, Result, WatchEvent, WatchStream};
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Watch history retained for resuming streams.
const HISTORY: usize = 1024;

type Versioned<K> = (u64, WatchEvent<K>);

struct Inner<K> {
    rv: u64,
    objects: BTreeMap<Key, K>,
    history: VecDeque<Versioned<K>>,
    /// Highest version evicted from `history`.
    compacted: u64,
}

pub struct MemoryStore<K: Object> {
    inner: Mutex<Inner<K>>,
    events: broadcast::Sender<Versioned<K>>,
    watchers: Mutex<CancellationToken>,
    paused: AtomicBool,
}

impl<K: Object> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Object> MemoryStore<K> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(HISTORY);
        Self {
            inner: Mutex::new(Inner { rv: 0, objects: BTreeMap::new(), history: VecDeque::new(), compacted: 0 }),
            events,
            watchers: Mutex::new(CancellationToken::new()),
            paused: AtomicBool::new(false),
        }
    }

    pub fn resource_version(&self) -> u64 {
        self.inner.lock().rv
    }

    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End every open watch stream. Writes keep working; new watches resume
    /// from history.
    pub fn disconnect_watchers(&self) {
        let old = std::mem::replace(&mut *self.watchers.lock(), CancellationToken::new());
        old.cancel();
        debug!("memory store: watchers disconnected");
    }

    /// While paused, writes are applied but never delivered to watchers nor
    /// kept in history, as if the stream lost them.
    pub fn set_stream_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    fn emit(&self, inner: &mut Inner<K>, rv: u64, ev: WatchEvent<K>) {
        if self.paused.load(Ordering::SeqCst) {
            trace!(rv, "memory store: event dropped while paused");
            return;
        }
        if inner.history.len() == HISTORY {
            if let Some((old, _)) = inner.history.pop_front() {
                inner.compacted = old;
            }
        }
        inner.history.push_back((rv, ev.clone()));
        // No receivers is fine.
        let _ = self.events.send((rv, ev));
    }
}

fn stamp<K: Object>(obj: &mut K, rv: u64) {
    obj.meta_mut().resource_version = Some(rv.to_string());
}

fn parse_rv(rv: &str) -> Result<u64> {
    if rv.is_empty() {
        return Ok(0);
    }
    rv.parse().map_err(|_| Error::Config(format!("invalid resource version {:?}", rv)))
}

#[async_trait::async_trait]
impl<K: Object> BackingStore<K> for MemoryStore<K> {
    async fn create(&self, obj: &K) -> Result<K> {
        let key = Key::of(obj);
        let mut inner = self.inner.lock();
        if inner.objects.contains_key(&key) {
            return Err(Error::Conflict(format!("{} already exists", key)));
        }
        inner.rv += 1;
        let rv = inner.rv;
        let mut stored = obj.clone();
        stamp(&mut stored, rv);
        if stored.meta().uid.is_none() {
            stored.meta_mut().uid = Some(format!("mem-{}", rv));
        }
        stored.meta_mut().deletion_timestamp = None;
        inner.objects.insert(key.clone(), stored.clone());
        self.emit(&mut inner, rv, WatchEvent::Added(stored.clone()));
        debug!(key = %key, rv, "memory store: created");
        Ok(stored)
    }

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        let key = Key::new(namespace, name);
        self.inner.lock().objects.get(&key).cloned().ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = Key::of(obj);
        let mut inner = self.inner.lock();
        let Some(current) = inner.objects.get(&key) else {
            return Err(Error::NotFound(key.to_string()));
        };
        if obj.resource_version() != current.resource_version() {
            return Err(Error::Conflict(format!(
                "{}: resource version {:?} is stale, stored {:?}",
                key,
                obj.resource_version(),
                current.resource_version()
            )));
        }
        let deleting = current.meta().deletion_timestamp.clone();
        inner.rv += 1;
        let rv = inner.rv;
        let mut stored = obj.clone();
        stamp(&mut stored, rv);
        stored.meta_mut().deletion_timestamp = deleting.clone();
        if deleting.is_some() && stored.finalizers().is_empty() {
            inner.objects.remove(&key);
            self.emit(&mut inner, rv, WatchEvent::Deleted(stored.clone()));
            debug!(key = %key, rv, "memory store: last finalizer released; purged");
        } else {
            inner.objects.insert(key.clone(), stored.clone());
            self.emit(&mut inner, rv, WatchEvent::Modified(stored.clone()));
            trace!(key = %key, rv, "memory store: updated");
        }
        Ok(stored)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = Key::new(namespace, name);
        let mut inner = self.inner.lock();
        let Some(current) = inner.objects.get(&key) else {
            return Err(Error::NotFound(key.to_string()));
        };
        if current.meta().deletion_timestamp.is_some() {
            return Ok(());
        }
        let mut stored = current.clone();
        inner.rv += 1;
        let rv = inner.rv;
        stamp(&mut stored, rv);
        if stored.finalizers().is_empty() {
            inner.objects.remove(&key);
            self.emit(&mut inner, rv, WatchEvent::Deleted(stored));
            debug!(key = %key, rv, "memory store: deleted");
        } else {
            stored.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
            inner.objects.insert(key.clone(), stored.clone());
            self.emit(&mut inner, rv, WatchEvent::Modified(stored));
            debug!(key = %key, rv, "memory store: deletion pending on finalizers");
        }
        Ok(())
    }

    async fn list(&self, filter: &ListFilter) -> Result<ObjectList<K>> {
        let inner = self.inner.lock();
        let items = inner.objects.values().filter(|o| filter.matches(*o)).cloned().collect();
        Ok(ObjectList { items, resource_version: inner.rv.to_string() })
    }

    async fn watch(&self, filter: &ListFilter, resource_version: &str) -> Result<WatchStream<K>> {
        let since = parse_rv(resource_version)?;
        let token = self.watchers.lock().clone();
        let (backlog, rx) = {
            let inner = self.inner.lock();
            if since < inner.compacted {
                return Err(Error::Gone(resource_version.to_string()));
            }
            let backlog: VecDeque<Versioned<K>> = inner
                .history
                .iter()
                .filter(|(rv, ev)| *rv > since && ev.object().map(|o| filter.matches(o)).unwrap_or(true))
                .cloned()
                .collect();
            (backlog, self.events.subscribe())
        };
        let state = Watch { backlog, rx, token, filter: filter.clone(), last: since };
        Ok(stream::unfold(state, next_event).boxed())
    }
}

struct Watch<K> {
    backlog: VecDeque<Versioned<K>>,
    rx: broadcast::Receiver<Versioned<K>>,
    token: CancellationToken,
    filter: ListFilter,
    last: u64,
}

async fn next_event<K: Object>(mut w: Watch<K>) -> Option<(Result<WatchEvent<K>>, Watch<K>)> {
    if let Some((rv, ev)) = w.backlog.pop_front() {
        w.last = rv;
        return Some((Ok(ev), w));
    }
    loop {
        let recv = tokio::select! {
            _ = w.token.cancelled() => return None,
            r = w.rx.recv() => r,
        };
        match recv {
            Ok((rv, ev)) => {
                if rv <= w.last {
                    continue;
                }
                w.last = rv;
                if ev.object().map(|o| w.filter.matches(o)).unwrap_or(true) {
                    return Some((Ok(ev), w));
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                let err = Error::Transient(format!("watch fell behind by {} events", n));
                return Some((Err(err), w));
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
