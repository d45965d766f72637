//! Kestrel controller engine.
//!
//! A [`Controller`] mirrors one resource type from a [`BackingStore`] into a
//! local [`Cache`], queues the key of every changed object and runs the
//! registered handlers for it on a pool of workers. Handlers are registered
//! before [`Controller::start`]; lifecycles wrap a create/updated/remove
//! triple so deletion waits for cleanup.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kestrel_core::{BackingStore, ControllerConfig, Error, Key, ListFilter, Object, Result, ScopeFilter};
use kestrel_queue::{RetryPolicy, WorkQueue};
use kestrel_store::{Cache, Lister};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod dispatch;
mod handler;
mod lifecycle;
mod reflector;
mod registry;

pub use dispatch::Dispatcher;
pub use handler::{Handler, Registration};
pub use lifecycle::{create_marker, finalizer_name, Lifecycle, LifecycleAdapter, LifecycleState};
pub use registry::{Registry, Starter};

enum State {
    Idle,
    Running { token: CancellationToken, tasks: Vec<JoinHandle<()>> },
    Stopped,
}

/// Start/stop-able unit mirroring one resource type and dispatching to handlers.
pub struct Controller<K: Object> {
    name: String,
    client: Arc<dyn BackingStore<K>>,
    filter: ListFilter,
    config: ControllerConfig,
    cache: Arc<Cache<K>>,
    queue: Arc<WorkQueue>,
    /// Taken by `start`; `None` afterwards.
    handlers: Mutex<Option<Vec<Registration<K>>>>,
    /// Cancelled by `stop` without taking `state`, so a start still waiting
    /// for its first listing gives up the lock.
    halt: CancellationToken,
    state: tokio::sync::Mutex<State>,
}

impl<K: Object> Controller<K> {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn BackingStore<K>>,
        filter: ListFilter,
        config: ControllerConfig,
    ) -> Self {
        let name = name.into();
        let retry = RetryPolicy::new(config.retry_base_delay, config.retry_max_delay);
        Self {
            queue: WorkQueue::new(name.clone(), retry),
            cache: Arc::new(Cache::new()),
            handlers: Mutex::new(Some(Vec::new())),
            halt: CancellationToken::new(),
            state: tokio::sync::Mutex::new(State::Idle),
            name,
            client,
            filter,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn BackingStore<K>> {
        &self.client
    }

    pub fn cache(&self) -> &Arc<Cache<K>> {
        &self.cache
    }

    pub fn lister(&self) -> Lister<K> {
        Lister::new(Arc::clone(&self.cache), self.name.clone())
    }

    fn register(&self, reg: Registration<K>) -> Result<()> {
        let mut handlers = self.handlers.lock();
        let Some(handlers) = handlers.as_mut() else {
            return Err(Error::Config(format!("{}: handler {} registered after start", self.name, reg.name)));
        };
        debug!(controller = %self.name, handler = %reg.name, filter = ?reg.filter, "handler registered");
        handlers.push(reg);
        Ok(())
    }

    pub fn add_handler<H>(&self, name: &str, filter: ScopeFilter, handler: H) -> Result<()>
    where
        H: Handler<K> + 'static,
    {
        self.register(Registration { name: name.to_string(), filter, handler: Arc::new(handler) })
    }

    /// Handler restricted to objects belonging to `cluster`.
    pub fn add_cluster_scoped_handler<H>(&self, name: &str, cluster: &str, handler: H) -> Result<()>
    where
        H: Handler<K> + 'static,
    {
        self.add_handler(name, ScopeFilter::Cluster(cluster.to_string()), handler)
    }

    pub fn add_lifecycle<L>(&self, name: &str, filter: ScopeFilter, lifecycle: L) -> Result<()>
    where
        L: Lifecycle<K> + 'static,
    {
        let adapter = LifecycleAdapter::new(name, false, Arc::clone(&self.client), lifecycle);
        self.add_handler(name, filter, adapter)
    }

    /// Lifecycle for one cluster's objects, with its own finalizer token.
    pub fn add_cluster_scoped_lifecycle<L>(&self, name: &str, cluster: &str, lifecycle: L) -> Result<()>
    where
        L: Lifecycle<K> + 'static,
    {
        let scoped = format!("{}_{}", name, cluster);
        let adapter = LifecycleAdapter::new(&scoped, true, Arc::clone(&self.client), lifecycle);
        self.add_handler(name, ScopeFilter::Cluster(cluster.to_string()), adapter)
    }

    pub fn enqueue(&self, namespace: Option<&str>, name: &str) {
        self.queue.add(Key::new(namespace, name));
    }

    /// Begin list+watch, wait for the initial listing, then start `workers`
    /// worker tasks. Calling it on a running controller is a no-op.
    pub async fn start(&self, shutdown: &CancellationToken, workers: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            State::Running { .. } => return Ok(()),
            State::Stopped => return Err(Error::Config(format!("{}: controller already stopped", self.name))),
            State::Idle => {}
        }
        if workers == 0 {
            return Err(Error::Config(format!("{}: workers must be at least 1", self.name)));
        }
        let handlers = self.handlers.lock().take().unwrap_or_default();
        let token = self.halt.child_token();
        let mut tasks = Vec::with_capacity(workers + 2);

        let reflector = reflector::Reflector::new(
            &self.name,
            Arc::clone(&self.client),
            self.filter.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.queue),
            &self.config,
        );
        tasks.push(tokio::spawn(reflector.run(token.clone())));
        tasks.push(tokio::spawn({
            let token = token.clone();
            let shutdown = shutdown.clone();
            let queue = Arc::clone(&self.queue);
            async move {
                tokio::select! {
                    _ = shutdown.cancelled() => token.cancel(),
                    _ = token.cancelled() => {}
                }
                queue.shutdown();
            }
        }));

        info!(controller = %self.name, handlers = handlers.len(), workers, "starting controller");
        tokio::select! {
            _ = self.cache.wait_synced() => {}
            _ = token.cancelled() => {
                warn!(controller = %self.name, "cancelled before cache synced");
                *state = State::Running { token, tasks };
                return Err(Error::other(format!("{}: cancelled before cache synced", self.name)));
            }
        }

        let dispatcher = Dispatcher::new(
            self.name.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.queue),
            handlers,
            self.config.max_retries,
        );
        tasks.extend(dispatcher.spawn_workers(workers));
        *state = State::Running { token, tasks };
        Ok(())
    }

    /// Wait until the cache holds a full listing.
    pub async fn sync(&self, shutdown: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = self.cache.wait_synced() => Ok(()),
            _ = shutdown.cancelled() => Err(Error::other(format!("{}: cancelled before cache synced", self.name))),
        }
    }

    /// Stop watching and let workers finish their in-flight keys.
    pub async fn stop(&self) {
        self.halt.cancel();
        let mut state = self.state.lock().await;
        let prev = std::mem::replace(&mut *state, State::Stopped);
        if let State::Running { token, tasks } = prev {
            token.cancel();
            self.queue.shutdown();
            for t in tasks {
                if let Err(e) = t.await {
                    warn!(controller = %self.name, error = %e, "controller task panicked");
                }
            }
            info!(controller = %self.name, "controller stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, State::Running { .. })
    }
}
