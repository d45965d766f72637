//! Controller tunables with documented defaults, overridable via `KESTREL_*`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Operational tuning for a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Worker tasks draining the queue (`KESTREL_WORKERS`, default 5).
    pub workers: usize,
    /// First retry delay for a failing key (`KESTREL_RETRY_BASE_MS`, default 500ms).
    pub retry_base_delay: Duration,
    /// Cap on the per-key retry delay (`KESTREL_RETRY_MAX_SECS`, default 1000s).
    pub retry_max_delay: Duration,
    /// Retries before a failing key is dropped (`KESTREL_MAX_RETRIES`, default 15).
    /// Finalization failures are retried past this ceiling.
    pub max_retries: u32,
    /// Periodic full relist and redelivery (`KESTREL_RESYNC_SECS`, default 2h; 0 disables).
    pub resync_interval: Option<Duration>,
    /// Cap on the delay between failed list/watch attempts (`KESTREL_WATCH_BACKOFF_MAX_SECS`, default 30s).
    pub watch_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(1000),
            max_retries: 15,
            resync_interval: Some(Duration::from_secs(2 * 60 * 60)),
            watch_backoff_max: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by any `KESTREL_*` variables present in the environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut cfg = Self::default();
        if let Some(n) = parse::<usize>(&lookup, "KESTREL_WORKERS")? {
            cfg.workers = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "KESTREL_RETRY_BASE_MS")? {
            cfg.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "KESTREL_RETRY_MAX_SECS")? {
            cfg.retry_max_delay = Duration::from_secs(secs);
        }
        if let Some(n) = parse::<u32>(&lookup, "KESTREL_MAX_RETRIES")? {
            cfg.max_retries = n;
        }
        if let Some(secs) = parse::<u64>(&lookup, "KESTREL_RESYNC_SECS")? {
            cfg.resync_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse::<u64>(&lookup, "KESTREL_WATCH_BACKOFF_MAX_SECS")? {
            cfg.watch_backoff_max = Duration::from_secs(secs);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(Error::Config(format!(
                "retry base delay {:?} exceeds max delay {:?}",
                self.retry_base_delay, self.retry_max_delay
            )));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, Error> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{}: cannot parse {:?}", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = ControllerConfig::from_lookup(env(&[])).expect("ok");
        assert_eq!(cfg, ControllerConfig::default());
    }

    #[test]
    fn overrides_and_disables_resync() {
        let cfg = ControllerConfig::from_lookup(env(&[
            ("KESTREL_WORKERS", "2"),
            ("KESTREL_RETRY_BASE_MS", "10"),
            ("KESTREL_MAX_RETRIES", "3"),
            ("KESTREL_RESYNC_SECS", "0"),
        ]))
        .expect("ok");
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.retry_base_delay, Duration::from_millis(10));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.resync_interval, None);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = ControllerConfig::from_lookup(env(&[("KESTREL_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = ControllerConfig::from_lookup(env(&[("KESTREL_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
