//! Kestrel core types: object keys, watch events, scope filters and the
//! backing store contract shared by the cache, queue and controller crates.

#![forbid(unsafe_code)]

use std::fmt;

use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

pub mod client;
pub mod config;
pub mod error;
pub mod selector;

pub use client::{BackingStore, ListFilter, WatchStream};
pub use config::ControllerConfig;
pub use error::{Error, Result};
pub use selector::Selector;

/// Label/annotation naming the cluster an object belongs to.
pub const CLUSTER_LABEL: &str = "kestrel.io/cluster";

/// Capability set every reconciled object provides.
///
/// Name, scope, resource version, finalizers, labels and annotations are
/// reached through [`kube::ResourceExt`]; any kube resource qualifies.
pub trait Object: Resource + Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<K> Object for K where K: Resource + Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

/// Canonical object identity: `scope/name` for scoped objects, `name` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(String);

impl Key {
    pub fn new(scope: Option<&str>, name: &str) -> Self {
        match scope {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(obj.meta().namespace.as_deref(), &obj.name_any())
    }

    pub fn scope(&self) -> Option<&str> {
        self.0.split_once('/').map(|(ns, _)| ns)
    }

    pub fn name(&self) -> &str {
        match self.0.split_once('/') {
            Some((_, name)) => name,
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of change carried by a watch event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// A single change observed on the backing store's watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker: the stream has seen everything up to this version.
    Bookmark(String),
}

impl<K: Resource> WatchEvent<K> {
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            WatchEvent::Added(_) => Some(EventKind::Added),
            WatchEvent::Modified(_) => Some(EventKind::Modified),
            WatchEvent::Deleted(_) => Some(EventKind::Deleted),
            WatchEvent::Bookmark(_) => None,
        }
    }

    pub fn object(&self) -> Option<&K> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            WatchEvent::Bookmark(_) => None,
        }
    }

    /// Resource version the stream has advanced to after this event.
    pub fn resource_version(&self) -> Option<String> {
        match self {
            WatchEvent::Bookmark(rv) => Some(rv.clone()),
            other => other.object().and_then(|o| o.resource_version()),
        }
    }
}

/// Full listing of the backing store at a point in time.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    /// Version to resume watching from.
    pub resource_version: String,
}

/// Restricts which objects a handler registration sees.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScopeFilter {
    #[default]
    All,
    /// Only objects in the given namespace-equivalent scope.
    Namespace(String),
    /// Only objects belonging to the named cluster.
    Cluster(String),
}

impl ScopeFilter {
    pub fn matches<K: Resource>(&self, obj: &K) -> bool {
        match self {
            ScopeFilter::All => true,
            ScopeFilter::Namespace(ns) => obj.meta().namespace.as_deref() == Some(ns.as_str()),
            ScopeFilter::Cluster(cluster) => object_in_cluster(cluster, obj),
        }
    }

    /// Key-only check used when the object is gone from the cache.
    pub fn matches_key(&self, key: &Key) -> bool {
        match self {
            ScopeFilter::Namespace(ns) => key.scope() == Some(ns.as_str()),
            ScopeFilter::All | ScopeFilter::Cluster(_) => true,
        }
    }
}

/// An object belongs to a cluster when its namespace carries the cluster's
/// name or it is labelled/annotated with it.
pub fn object_in_cluster<K: Resource>(cluster: &str, obj: &K) -> bool {
    let meta = obj.meta();
    if meta.namespace.as_deref() == Some(cluster) {
        return true;
    }
    let labelled = meta.labels.as_ref().and_then(|l| l.get(CLUSTER_LABEL)).map(|v| v == cluster);
    let annotated = meta.annotations.as_ref().and_then(|a| a.get(CLUSTER_LABEL)).map(|v| v == cluster);
    labelled.or(annotated).unwrap_or(false)
}

/// True once the backing store has marked the object for deletion.
pub fn deletion_requested<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub mod prelude {
    pub use super::{
        deletion_requested, BackingStore, ControllerConfig, Error, EventKind, Key, ListFilter, Object,
        ObjectList, Result, ScopeFilter, Selector, WatchEvent, WatchStream,
    };
}
