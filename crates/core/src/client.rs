//! Contract for the authoritative store a controller mirrors.

use futures::stream::BoxStream;

use crate::error::Result;
use crate::selector::Selector;
use crate::{Object, ObjectList, WatchEvent};

/// Stream of watch events; ends when the backing store drops the connection.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Narrows List/Watch to one scope and/or a label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub namespace: Option<String>,
    pub selector: Selector,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespaced(ns: impl Into<String>) -> Self {
        Self { namespace: Some(ns.into()), selector: Selector::everything() }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn matches<K: Object>(&self, obj: &K) -> bool {
        let ns_ok = match &self.namespace {
            Some(ns) => obj.meta().namespace.as_deref() == Some(ns.as_str()),
            None => true,
        };
        ns_ok && self.selector.matches(obj)
    }
}

/// CRUD plus List/Watch against the backing store for one resource type.
///
/// `update` must fail with [`crate::Error::Conflict`] when the stored
/// resource version moved past the one carried by the argument.
#[async_trait::async_trait]
pub trait BackingStore<K: Object>: Send + Sync {
    async fn create(&self, obj: &K) -> Result<K>;

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K>;

    async fn update(&self, obj: &K) -> Result<K>;

    /// Request deletion. Objects still carrying finalizers are only marked.
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()>;

    async fn list(&self, filter: &ListFilter) -> Result<ObjectList<K>>;

    /// Stream changes that happened after `resource_version`.
    async fn watch(&self, filter: &ListFilter, resource_version: &str) -> Result<WatchStream<K>>;
}
