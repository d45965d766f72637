#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kestrel_controller::Controller;
use kestrel_core::{ControllerConfig, ListFilter};
use kestrel_kubehub::MemoryStore;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

pub fn widget(ns: &str, name: &str) -> DynamicObject {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("kestrel.io", "v1", "Widget"));
    DynamicObject::new(name, &ar).within(ns)
}

/// Short delays so retry paths finish within a test.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        workers: 4,
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(40),
        max_retries: 3,
        resync_interval: None,
        watch_backoff_max: Duration::from_millis(50),
    }
}

pub fn controller(store: &Arc<MemoryStore<DynamicObject>>, config: ControllerConfig) -> Controller<DynamicObject> {
    Controller::new("widgets", store.clone(), ListFilter::all(), config)
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
