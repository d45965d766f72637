use std::sync::Arc;

use kestrel_core::{Error, Key, Object, Result, Selector};

use crate::{Cache, Listing};

/// Read-only accessor over a controller's cache. Never touches the network.
pub struct Lister<K> {
    cache: Arc<Cache<K>>,
    resource: String,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self { cache: Arc::clone(&self.cache), resource: self.resource.clone() }
    }
}

impl<K: Object> Lister<K> {
    pub fn new(cache: Arc<Cache<K>>, resource: impl Into<String>) -> Self {
        Self { cache, resource: resource.into() }
    }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Result<Arc<K>> {
        let key = Key::new(namespace, name);
        self.cache
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("{} {}", self.resource, key)))
    }

    pub fn list(&self, namespace: Option<&str>, selector: &Selector) -> Listing<K, impl Fn(&K) -> bool> {
        let selector = selector.clone();
        self.cache.list(namespace, move |o: &K| selector.matches(o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::EventKind;
    use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
    use kube::ResourceExt;

    fn obj(ns: &str, name: &str, app: &str) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("kestrel.io", "v1", "Widget"));
        let mut o = DynamicObject::new(name, &ar).within(ns);
        o.labels_mut().insert("app".into(), app.into());
        o
    }

    #[test]
    fn get_missing_is_not_found() {
        let lister = Lister::new(Arc::new(Cache::<DynamicObject>::new()), "widgets");
        let err = lister.get(Some("a"), "x").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not_found: widgets a/x");
    }

    #[test]
    fn list_filters_by_scope_and_selector() {
        let cache = Arc::new(Cache::new());
        cache.on_event(EventKind::Added, obj("a", "x", "web"));
        cache.on_event(EventKind::Added, obj("a", "y", "db"));
        cache.on_event(EventKind::Added, obj("b", "z", "web"));
        let lister = Lister::new(Arc::clone(&cache), "widgets");

        let web: Selector = "app=web".parse().expect("ok");
        let all: Vec<String> = lister.list(None, &web).iter().map(|o| o.name_any()).collect();
        assert_eq!(all, vec!["x", "z"]);
        let in_a: Vec<String> = lister.list(Some("a"), &web).iter().map(|o| o.name_any()).collect();
        assert_eq!(in_a, vec!["x"]);
        assert_eq!(lister.get(Some("b"), "z").expect("present").name_any(), "z");
    }
}
