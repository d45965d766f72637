use std::future::Future;
use std::sync::Arc;

use kestrel_core::{Key, Object, Result, ScopeFilter};

/// Reconciles one key. `obj` is the cached state, `None` once the object is gone.
///
/// Returning `Some(obj)` hands a possibly modified object to the handlers
/// registered after this one; `None` means nothing changed.
#[async_trait::async_trait]
pub trait Handler<K: Object>: Send + Sync {
    async fn sync(&self, key: &Key, obj: Option<K>) -> Result<Option<K>>;
}

#[async_trait::async_trait]
impl<K, F, Fut> Handler<K> for F
where
    K: Object,
    F: Fn(Key, Option<K>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<K>>> + Send + 'static,
{
    async fn sync(&self, key: &Key, obj: Option<K>) -> Result<Option<K>> {
        (self)(key.clone(), obj).await
    }
}

/// A named handler plus the scope it applies to.
pub struct Registration<K> {
    pub name: String,
    pub filter: ScopeFilter,
    pub handler: Arc<dyn Handler<K>>,
}

impl<K> Clone for Registration<K> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), filter: self.filter.clone(), handler: Arc::clone(&self.handler) }
    }
}

impl<K: Object> Registration<K> {
    pub fn applies_to(&self, key: &Key, obj: Option<&K>) -> bool {
        match obj {
            Some(o) => self.filter.matches(o),
            None => self.filter.matches_key(key),
        }
    }
}
