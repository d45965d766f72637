use std::any::{Any, TypeId};
use std::sync::Arc;

use kestrel_core::{Error, Object, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Controller;

/// Type-erased lifecycle of a controller, so the registry can drive
/// controllers of different resource types together.
#[async_trait::async_trait]
pub trait Starter: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, shutdown: &CancellationToken, workers: usize) -> Result<()>;

    async fn sync(&self, shutdown: &CancellationToken) -> Result<()>;

    async fn stop(&self);
}

#[async_trait::async_trait]
impl<K: Object> Starter for Controller<K> {
    fn name(&self) -> &str {
        Controller::name(self)
    }

    async fn start(&self, shutdown: &CancellationToken, workers: usize) -> Result<()> {
        Controller::start(self, shutdown, workers).await
    }

    async fn sync(&self, shutdown: &CancellationToken) -> Result<()> {
        Controller::sync(self, shutdown).await
    }

    async fn stop(&self) {
        Controller::stop(self).await
    }
}

/// Object type, resource identity (a GVK key such as `apps/v1/Deployment`)
/// and namespace. Dynamic objects share one type, so the resource tells
/// their kinds apart.
type Slot = (TypeId, String, Option<String>);

/// Owns at most one controller per (object type, resource, namespace). Built
/// once by the hosting application and passed to whoever registers handlers.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<FxHashMap<Slot, Arc<dyn Any + Send + Sync>>>,
    order: Mutex<Vec<Arc<dyn Starter>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The controller for `resource` of type `K` in `namespace`, created with
    /// `make` on first use.
    pub fn controller<K, F>(&self, resource: &str, namespace: Option<&str>, make: F) -> Result<Arc<Controller<K>>>
    where
        K: Object,
        F: FnOnce() -> Controller<K>,
    {
        let slot = (TypeId::of::<K>(), resource.to_string(), namespace.map(str::to_string));
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&slot) {
            return Arc::clone(existing).downcast::<Controller<K>>().map_err(|_| {
                Error::Config(format!("registry slot {} {:?} holds a different controller type", resource, namespace))
            });
        }
        let controller = Arc::new(make());
        info!(controller = %controller.name(), resource = %resource, ns = ?namespace, "controller registered");
        self.order.lock().push(controller.clone() as Arc<dyn Starter>);
        entries.insert(slot, controller.clone() as Arc<dyn Any + Send + Sync>);
        Ok(controller)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn starters(&self) -> Vec<Arc<dyn Starter>> {
        self.order.lock().clone()
    }

    /// Start every registered controller, in registration order.
    pub async fn start_all(&self, shutdown: &CancellationToken, workers: usize) -> Result<()> {
        for s in self.starters() {
            s.start(shutdown, workers).await?;
        }
        Ok(())
    }

    pub async fn sync_all(&self, shutdown: &CancellationToken) -> Result<()> {
        for s in self.starters() {
            s.sync(shutdown).await?;
        }
        Ok(())
    }

    /// Stop every controller, most recently registered first.
    pub async fn stop_all(&self) {
        for s in self.starters().into_iter().rev() {
            s.stop().await;
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.starters().iter().map(|s| s.name().to_string()).collect()
    }
}
