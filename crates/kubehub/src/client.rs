use futures::{StreamExt, TryStreamExt};
use kestrel_core::{BackingStore, Error, ListFilter, ObjectList, Result, WatchEvent, WatchStream};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, WatchParams},
    core::{ApiResource, DynamicObject},
    Client, ResourceExt,
};
use tracing::{debug, trace};

/// Backing store over the Kubernetes API server for one discovered resource.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
}

impl KubeStore {
    pub fn new(client: Client, resource: ApiResource, namespaced: bool) -> Self {
        Self { client, resource, namespaced }
    }

    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    pub fn namespaced(&self) -> bool {
        self.namespaced
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if self.namespaced => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            _ => Api::all_with(self.client.clone(), &self.resource),
        }
    }

    fn params(filter: &ListFilter) -> (Option<String>, String) {
        let labels = if filter.selector.selects_all() { String::new() } else { filter.selector.to_string() };
        (filter.namespace.clone(), labels)
    }
}

pub(crate) fn map_err(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => Error::NotFound(resp.message),
            409 => Error::Conflict(resp.message),
            410 => Error::Gone(resp.message),
            _ => Error::Transient(format!("{} ({})", resp.message, resp.code)),
        },
        other => Error::Transient(other.to_string()),
    }
}

fn map_event(ev: kube::core::WatchEvent<DynamicObject>) -> Result<WatchEvent<DynamicObject>> {
    use kube::core::WatchEvent as Raw;
    match ev {
        Raw::Added(o) => Ok(WatchEvent::Added(o)),
        Raw::Modified(o) => Ok(WatchEvent::Modified(o)),
        Raw::Deleted(o) => Ok(WatchEvent::Deleted(o)),
        Raw::Bookmark(b) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
        Raw::Error(resp) if resp.code == 410 => Err(Error::Gone(resp.message)),
        Raw::Error(resp) => Err(Error::Transient(format!("watch error: {} ({})", resp.message, resp.code))),
    }
}

#[async_trait::async_trait]
impl BackingStore<DynamicObject> for KubeStore {
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        self.api(obj.namespace().as_deref()).create(&PostParams::default(), obj).await.map_err(map_err)
    }

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        self.api(namespace).get(name).await.map_err(map_err)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.name_any();
        trace!(name = %name, rv = ?obj.resource_version(), "replace");
        self.api(obj.namespace().as_deref()).replace(&name, &PostParams::default(), obj).await.map_err(map_err)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        self.api(namespace).delete(name, &DeleteParams::default()).await.map_err(map_err)?;
        Ok(())
    }

    async fn list(&self, filter: &ListFilter) -> Result<ObjectList<DynamicObject>> {
        let (ns, labels) = Self::params(filter);
        let lp = if labels.is_empty() { ListParams::default() } else { ListParams::default().labels(&labels) };
        let list = self.api(ns.as_deref()).list(&lp).await.map_err(map_err)?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(kind = %self.resource.kind, items = list.items.len(), rv = %resource_version, "listed");
        Ok(ObjectList { items: list.items, resource_version })
    }

    async fn watch(&self, filter: &ListFilter, resource_version: &str) -> Result<WatchStream<DynamicObject>> {
        let (ns, labels) = Self::params(filter);
        let wp = if labels.is_empty() { WatchParams::default() } else { WatchParams::default().labels(&labels) };
        let stream = self.api(ns.as_deref()).watch(&wp, resource_version).await.map_err(map_err)?;
        Ok(stream.map_err(map_err).map(|r| r.and_then(map_event)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("code {}", code),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn api_codes_map_to_error_kinds() {
        assert!(map_err(api_err(404)).is_not_found());
        assert!(map_err(api_err(409)).is_conflict());
        assert!(matches!(map_err(api_err(410)), Error::Gone(_)));
        assert!(matches!(map_err(api_err(503)), Error::Transient(_)));
    }
}
