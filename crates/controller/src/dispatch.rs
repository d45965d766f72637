use std::sync::Arc;
use std::time::Instant;

use kestrel_core::{Error, Key, Object, Result};
use kestrel_queue::WorkQueue;
use kestrel_store::Cache;
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::handler::Registration;

/// Pulls keys off the queue, resolves them against the cache and runs every
/// matching handler in registration order.
pub struct Dispatcher<K> {
    name: String,
    cache: Arc<Cache<K>>,
    queue: Arc<WorkQueue>,
    handlers: Arc<[Registration<K>]>,
    max_retries: u32,
}

impl<K> Clone for Dispatcher<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            cache: Arc::clone(&self.cache),
            queue: Arc::clone(&self.queue),
            handlers: Arc::clone(&self.handlers),
            max_retries: self.max_retries,
        }
    }
}

impl<K: Object> Dispatcher<K> {
    pub fn new(
        name: impl Into<String>,
        cache: Arc<Cache<K>>,
        queue: Arc<WorkQueue>,
        handlers: Vec<Registration<K>>,
        max_retries: u32,
    ) -> Self {
        Self { name: name.into(), cache, queue, handlers: handlers.into(), max_retries }
    }

    /// Start `n` worker loops. Each exits once the queue shuts down, after
    /// finishing the key it is working on.
    pub fn spawn_workers(&self, n: usize) -> Vec<JoinHandle<()>> {
        (0..n.max(1))
            .map(|id| {
                let me = self.clone();
                tokio::spawn(async move { me.worker(id).await })
            })
            .collect()
    }

    async fn worker(self, id: usize) {
        debug!(controller = %self.name, worker = id, "worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(controller = %self.name, worker = id, "worker stopped");
    }

    /// Run handlers for `key` once and apply the retry policy to the outcome.
    pub async fn process(&self, key: &Key) {
        match self.sync(key).await {
            Ok(()) => self.queue.forget(key),
            Err(e) => self.handle_error(key, e),
        }
    }

    /// Run every matching handler against the current cached state of `key`.
    pub async fn sync(&self, key: &Key) -> Result<()> {
        let mut obj = self.cache.get(key).map(|o| K::clone(&o));
        let mut errors: Vec<Error> = Vec::new();
        for reg in self.handlers.iter() {
            if !reg.applies_to(key, obj.as_ref()) {
                continue;
            }
            let started = Instant::now();
            let out = reg.handler.sync(key, obj.clone()).await;
            histogram!(
                "controller_handler_ms",
                started.elapsed().as_secs_f64() * 1000.0,
                "controller" => self.name.clone(),
                "handler" => reg.name.clone()
            );
            match out {
                Ok(Some(next)) => obj = Some(next),
                Ok(None) => {}
                Err(e) => {
                    counter!("controller_handler_failures_total", 1u64, "controller" => self.name.clone(), "handler" => reg.name.clone());
                    errors.push(Error::handler(&reg.name, e));
                }
            }
        }
        aggregate(errors)
    }

    fn handle_error(&self, key: &Key, err: Error) {
        if err.is_forget() {
            debug!(controller = %self.name, key = %key, error = %err, "handler asked to forget key");
            self.queue.forget(key);
            return;
        }
        if !err.is_retryable() {
            error!(controller = %self.name, key = %key, error = %err, "non-retryable failure; dropping key");
            counter!("controller_items_dropped_total", 1u64, "controller" => self.name.clone());
            self.queue.forget(key);
            return;
        }
        let retries = self.queue.num_requeues(key);
        if err.is_finalization() {
            counter!("controller_finalization_failures_total", 1u64, "controller" => self.name.clone());
            let delay = self.queue.add_rate_limited(key.clone());
            if retries >= self.max_retries {
                error!(controller = %self.name, key = %key, retries, error = %err, delay_ms = delay.as_millis() as u64, "finalization still failing; retrying");
            } else {
                warn!(controller = %self.name, key = %key, retries, error = %err, delay_ms = delay.as_millis() as u64, "finalization failed; retrying");
            }
            return;
        }
        if retries >= self.max_retries {
            error!(controller = %self.name, key = %key, retries, error = %err, "retries exhausted; dropping key");
            counter!("controller_items_dropped_total", 1u64, "controller" => self.name.clone());
            self.queue.forget(key);
            return;
        }
        let delay = self.queue.add_rate_limited(key.clone());
        if err.is_conflict() {
            debug!(controller = %self.name, key = %key, error = %err, "write conflict; requeued");
        } else {
            warn!(controller = %self.name, key = %key, retries, error = %err, delay_ms = delay.as_millis() as u64, "handler failed; requeued");
        }
    }
}

/// One error per failed handler. Finalization failures take precedence so
/// the key is never dropped while cleanup is outstanding, then any retryable
/// failure. A forget request only wins when every handler asked for it.
fn aggregate(mut errors: Vec<Error>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let pick = errors
        .iter()
        .position(Error::is_finalization)
        .or_else(|| errors.iter().position(Error::is_retryable))
        .or_else(|| errors.iter().position(|e| !e.is_forget()))
        .unwrap_or(0);
    let chosen = errors.swap_remove(pick);
    for other in errors {
        warn!(error = %other, "additional handler failure");
    }
    Err(chosen)
}
