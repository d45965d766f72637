use thiserror::Error;

/// Error kinds surfaced by the cache, backing store and handler layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not_found: {0}")]
    NotFound(String),
    /// Optimistic-concurrency mismatch on write.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Backing store unavailable or the network failed; retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Watch resumed from a version the backing store no longer retains.
    #[error("gone: resource version {0} too old")]
    Gone(String),
    #[error("handler {handler} failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: Box<Error>,
    },
    #[error("finalizer {finalizer} not released: {source}")]
    Finalization {
        finalizer: String,
        #[source]
        source: Box<Error>,
    },
    /// Drop the key without retrying.
    #[error("forget: {0}")]
    Forget(String),
    #[error("config: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn other(msg: impl std::fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }

    pub fn handler(handler: &str, source: Error) -> Self {
        Error::Handler { handler: handler.to_string(), source: Box::new(source) }
    }

    pub fn finalization(finalizer: &str, source: Error) -> Self {
        Error::Finalization { finalizer: finalizer.to_string(), source: Box::new(source) }
    }

    /// The innermost error, unwrapping handler/finalization wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Handler { source, .. } | Error::Finalization { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict(_))
    }

    pub fn is_forget(&self) -> bool {
        matches!(self.root(), Error::Forget(_))
    }

    /// Finalization failures must be retried until they succeed.
    pub fn is_finalization(&self) -> bool {
        match self {
            Error::Finalization { .. } => true,
            Error::Handler { source, .. } => source.is_finalization(),
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.root(), Error::Forget(_) | Error::Config(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("serde: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_unwraps_nested_wrappers() {
        let e = Error::handler("h", Error::finalization("f", Error::Conflict("a/x".into())));
        assert!(e.is_conflict());
        assert!(e.is_finalization());
        assert!(e.is_retryable());
    }

    #[test]
    fn forget_is_not_retryable() {
        let e = Error::handler("h", Error::Forget("done".into()));
        assert!(e.is_forget());
        assert!(!e.is_retryable());
        assert!(!e.is_finalization());
    }
}
