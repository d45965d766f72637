//! Create/Updated/Remove handlers with finalizer-gated deletion.
//!
//! The adapter owns one finalizer token per registration. The token is
//! stored before `create` runs and only released after `remove` succeeded,
//! so the backing store cannot purge the object before cleanup ran.

use std::sync::Arc;

use kestrel_core::{deletion_requested, BackingStore, Error, Key, Object, Result};
use kube::ResourceExt;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::handler::Handler;

/// Per-object lifecycle callbacks. Returning `Some(obj)` asks the adapter to
/// persist the modified object.
#[async_trait::async_trait]
pub trait Lifecycle<K: Object>: Send + Sync {
    async fn create(&self, obj: K) -> Result<Option<K>>;

    async fn updated(&self, obj: K) -> Result<Option<K>>;

    async fn remove(&self, obj: K) -> Result<Option<K>>;
}

/// Where an object stands relative to one adapter's finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    PendingDeletion,
    Finalizing,
    Gone,
}

pub fn finalizer_name(name: &str, cluster_scoped: bool) -> String {
    if cluster_scoped {
        format!("clusterscoped.controller.kestrel.io/{}", name)
    } else {
        format!("controller.kestrel.io/{}", name)
    }
}

pub fn create_marker(name: &str) -> String {
    format!("lifecycle.kestrel.io/create.{}", name)
}

pub struct LifecycleAdapter<K, L> {
    name: String,
    finalizer: String,
    marker: String,
    lifecycle: L,
    client: Arc<dyn BackingStore<K>>,
    finalizing: Mutex<FxHashSet<Key>>,
    /// Version each key had before this adapter's latest write.
    superseded: Mutex<FxHashMap<Key, String>>,
}

impl<K: Object, L: Lifecycle<K>> LifecycleAdapter<K, L> {
    pub fn new(name: &str, cluster_scoped: bool, client: Arc<dyn BackingStore<K>>, lifecycle: L) -> Self {
        Self {
            name: name.to_string(),
            finalizer: finalizer_name(name, cluster_scoped),
            marker: create_marker(name),
            lifecycle,
            client,
            finalizing: Mutex::new(FxHashSet::default()),
            superseded: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    pub fn state(&self, key: &Key, obj: Option<&K>) -> LifecycleState {
        match obj {
            None => LifecycleState::Gone,
            Some(o) if deletion_requested(o) => {
                if !self.has_finalizer(o) {
                    LifecycleState::Gone
                } else if self.finalizing.lock().contains(key) {
                    LifecycleState::Finalizing
                } else {
                    LifecycleState::PendingDeletion
                }
            }
            Some(_) => LifecycleState::Active,
        }
    }

    fn has_finalizer(&self, obj: &K) -> bool {
        obj.finalizers().iter().any(|f| f == &self.finalizer)
    }

    fn add_finalizer(&self, obj: &mut K) -> bool {
        if self.has_finalizer(obj) {
            return false;
        }
        obj.finalizers_mut().push(self.finalizer.clone());
        true
    }

    fn is_initialized(&self, obj: &K) -> bool {
        obj.annotations().get(&self.marker).map(|v| v == "true").unwrap_or(false)
    }

    async fn finalize(&self, key: &Key, obj: K) -> Result<Option<K>> {
        if !self.has_finalizer(&obj) {
            debug!(lifecycle = %self.name, key = %key, "deleting without our finalizer; nothing to do");
            return Ok(None);
        }
        self.finalizing.lock().insert(key.clone());
        let out = self.release(key, obj).await;
        self.finalizing.lock().remove(key);
        out
    }

    async fn release(&self, key: &Key, obj: K) -> Result<Option<K>> {
        debug!(lifecycle = %self.name, key = %key, "finalizing");
        let removed = self
            .lifecycle
            .remove(obj.clone())
            .await
            .map_err(|e| Error::finalization(&self.finalizer, e))?;
        let mut next = removed.unwrap_or(obj);
        next.finalizers_mut().retain(|f| f != &self.finalizer);
        let updated = self.persist(key, &next).await.map_err(|e| Error::finalization(&self.finalizer, e))?;
        info!(lifecycle = %self.name, key = %key, finalizer = %self.finalizer, "finalizer released");
        Ok(Some(updated))
    }

    async fn create(&self, key: &Key, obj: K) -> Result<Option<K>> {
        let obj = if self.has_finalizer(&obj) {
            obj
        } else {
            let mut guarded = obj;
            self.add_finalizer(&mut guarded);
            let stored = self.persist(key, &guarded).await?;
            debug!(lifecycle = %self.name, key = %key, rv = ?stored.resource_version(), "finalizer added");
            stored
        };
        let out = self.lifecycle.create(obj.clone()).await?;
        let mut next = out.unwrap_or_else(|| obj.clone());
        self.add_finalizer(&mut next);
        next.annotations_mut().insert(self.marker.clone(), "true".to_string());
        let updated = self.persist(key, &next).await?;
        debug!(lifecycle = %self.name, key = %key, rv = ?updated.resource_version(), "created");
        Ok(Some(updated))
    }

    /// Write `obj` and remember the version it replaced, so a cache that has
    /// not yet caught up with this write is not reconciled again.
    async fn persist(&self, key: &Key, obj: &K) -> Result<K> {
        let updated = self.client.update(obj).await?;
        if let Some(rv) = obj.resource_version() {
            self.superseded.lock().insert(key.clone(), rv);
        }
        Ok(updated)
    }

    fn is_superseded(&self, key: &Key, obj: &K) -> bool {
        let mut superseded = self.superseded.lock();
        match superseded.get(key) {
            Some(rv) if obj.resource_version().as_ref() == Some(rv) => true,
            Some(_) => {
                superseded.remove(key);
                false
            }
            None => false,
        }
    }

    async fn record(&self, key: &Key, obj: K) -> Result<Option<K>> {
        let mut next = match self.lifecycle.updated(obj.clone()).await? {
            Some(o) => o,
            None => obj.clone(),
        };
        if self.add_finalizer(&mut next) {
            debug!(lifecycle = %self.name, key = %key, "finalizer missing; restoring");
        }
        if next == obj {
            return Ok(None);
        }
        Ok(Some(self.persist(key, &next).await?))
    }
}

#[async_trait::async_trait]
impl<K: Object, L: Lifecycle<K>> Handler<K> for LifecycleAdapter<K, L> {
    async fn sync(&self, key: &Key, obj: Option<K>) -> Result<Option<K>> {
        let Some(obj) = obj else {
            self.superseded.lock().remove(key);
            return Ok(None);
        };
        if self.is_superseded(key, &obj) {
            debug!(lifecycle = %self.name, key = %key, "cache behind our own write; waiting for it");
            return Ok(None);
        }
        if deletion_requested(&obj) {
            return self.finalize(key, obj).await;
        }
        if !self.is_initialized(&obj) {
            return self.create(key, obj).await;
        }
        self.record(key, obj).await
    }
}
