//! List+watch loop mirroring the backing store into the cache.
//!
//! Runs as a single task per controller so events are applied in stream
//! order. Any watch failure or disconnect falls back to a full relist.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kestrel_core::{BackingStore, ControllerConfig, Error, Key, ListFilter, Object, WatchEvent};
use kestrel_queue::WorkQueue;
use kestrel_store::Cache;
use metrics::counter;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Redeliver {
    /// Enqueue keys whose state differs from the cache.
    Changed,
    /// Enqueue every key (periodic resync).
    All,
}

enum Next {
    Relist,
    Rewatch,
    Stop,
}

pub(crate) struct Reflector<K: Object> {
    name: String,
    client: Arc<dyn BackingStore<K>>,
    filter: ListFilter,
    cache: Arc<Cache<K>>,
    queue: Arc<WorkQueue>,
    resync_interval: Option<Duration>,
    backoff_max: Duration,
    failures: u32,
}

impl<K: Object> Reflector<K> {
    pub(crate) fn new(
        name: &str,
        client: Arc<dyn BackingStore<K>>,
        filter: ListFilter,
        cache: Arc<Cache<K>>,
        queue: Arc<WorkQueue>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            client,
            filter,
            cache,
            queue,
            resync_interval: config.resync_interval,
            backoff_max: config.watch_backoff_max.max(INITIAL_BACKOFF),
            failures: 0,
        }
    }

    pub(crate) async fn run(mut self, token: CancellationToken) {
        let Some(mut rv) = self.relist(&token, Redeliver::Changed).await else {
            return;
        };
        info!(controller = %self.name, rv = %rv, objects = self.cache.len(), "cache synced");
        let mut resync = self.resync_interval.map(|every| {
            let mut iv = tokio::time::interval_at(Instant::now() + every, every);
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            iv
        });
        loop {
            let next = self.watch(&token, &mut rv, &mut resync).await;
            match next {
                Next::Stop => break,
                Next::Rewatch => continue,
                Next::Relist => {
                    if !self.pause(&token).await {
                        break;
                    }
                    match self.relist(&token, Redeliver::Changed).await {
                        Some(v) => rv = v,
                        None => break,
                    }
                }
            }
        }
        debug!(controller = %self.name, "reflector stopped");
    }

    async fn watch(&mut self, token: &CancellationToken, rv: &mut String, resync: &mut Option<Interval>) -> Next {
        let stream = tokio::select! {
            _ = token.cancelled() => return Next::Stop,
            s = self.client.watch(&self.filter, rv) => s,
        };
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(controller = %self.name, error = %e, "watch failed to open; relisting");
                self.failures = self.failures.saturating_add(1);
                return Next::Relist;
            }
        };
        debug!(controller = %self.name, rv = %rv, "watch opened");
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Next::Stop,
                _ = tick(resync) => {
                    info!(controller = %self.name, "periodic resync");
                    return match self.relist(token, Redeliver::All).await {
                        Some(v) => {
                            *rv = v;
                            Next::Rewatch
                        }
                        None => Next::Stop,
                    };
                }
                ev = stream.next() => match ev {
                    Some(Ok(ev)) => {
                        self.failures = 0;
                        self.observe(ev, rv);
                    }
                    Some(Err(Error::Gone(old))) => {
                        warn!(controller = %self.name, rv = %old, "watch expired; relisting");
                        return Next::Relist;
                    }
                    Some(Err(e)) => {
                        warn!(controller = %self.name, error = %e, "watch stream error; relisting");
                        self.failures = self.failures.saturating_add(1);
                        return Next::Relist;
                    }
                    None => {
                        warn!(controller = %self.name, "watch stream disconnected; relisting");
                        return Next::Relist;
                    }
                },
            }
        }
    }

    fn observe(&self, ev: WatchEvent<K>, rv: &mut String) {
        if let Some(v) = ev.resource_version() {
            *rv = v;
        }
        if let Some(kind) = ev.kind() {
            counter!("controller_events_total", 1u64, "controller" => self.name.clone(), "kind" => format!("{:?}", kind));
        }
        if let Some(key) = self.cache.apply(ev) {
            debug!(controller = %self.name, key = %key, "event");
            self.queue.add(key);
        }
    }

    /// Full list into the cache, retried with backoff. `None` when cancelled.
    async fn relist(&mut self, token: &CancellationToken, mode: Redeliver) -> Option<String> {
        loop {
            let listed = tokio::select! {
                _ = token.cancelled() => return None,
                l = self.client.list(&self.filter) => l,
            };
            match listed {
                Ok(list) => {
                    let changed = self.cache.replace(list.items);
                    let keys: Vec<Key> = match mode {
                        Redeliver::Changed => changed,
                        Redeliver::All => {
                            let mut all = self.cache.keys();
                            all.extend(changed.into_iter().filter(|k| !self.cache.contains(k)));
                            all
                        }
                    };
                    counter!("controller_resyncs_total", 1u64, "controller" => self.name.clone());
                    debug!(controller = %self.name, enqueued = keys.len(), mode = ?mode, "relisted");
                    for key in keys {
                        self.queue.add(key);
                    }
                    return Some(list.resource_version);
                }
                Err(e) => {
                    self.failures = self.failures.saturating_add(1);
                    warn!(controller = %self.name, error = %e, failures = self.failures, "list failed");
                    if !self.pause(token).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep for the current failure backoff. `false` when cancelled meanwhile.
    async fn pause(&self, token: &CancellationToken) -> bool {
        if self.failures == 0 {
            return !token.is_cancelled();
        }
        let exp = self.failures.saturating_sub(1).min(16);
        let delay = INITIAL_BACKOFF.saturating_mul(1u32 << exp).min(self.backoff_max);
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
