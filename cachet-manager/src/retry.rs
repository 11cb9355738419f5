//! Fixed-delay retry on optimistic-concurrency conflicts.

use cachet_core::{CachetError, ManagerObserver, RetryConfig};
use cachet_core::observer::notify;
use tracing::{debug, warn};

/// Outcome of one attempt at a managed write.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// Lost a race with another writer; worth another try.
    Conflict(CachetError),
    /// Retrying cannot change the outcome.
    Fatal(CachetError),
}

impl AttemptError {
    pub(crate) fn into_inner(self) -> CachetError {
        match self {
            AttemptError::Conflict(e) | AttemptError::Fatal(e) => e,
        }
    }
}

impl From<CachetError> for AttemptError {
    fn from(error: CachetError) -> Self {
        if error.is_version_mismatch() {
            AttemptError::Conflict(error)
        } else {
            AttemptError::Fatal(error)
        }
    }
}

/// Tracks retries of one managed action.
pub(crate) struct Backoff<'a> {
    action: &'static str,
    config: &'a RetryConfig,
    observer: &'a dyn ManagerObserver,
    retries: u32,
}

impl<'a> Backoff<'a> {
    pub(crate) fn new(
        action: &'static str,
        config: &'a RetryConfig,
        observer: &'a dyn ManagerObserver,
    ) -> Self {
        Self {
            action,
            config,
            observer,
            retries: 0,
        }
    }

    /// Retries performed so far.
    pub(crate) fn retries(&self) -> u32 {
        self.retries
    }

    /// Decide whether `error` earns another attempt. Sleeps the configured
    /// delay before answering `true`.
    pub(crate) async fn retry(&mut self, error: &AttemptError) -> bool {
        let cause = match error {
            AttemptError::Fatal(_) => return false,
            AttemptError::Conflict(cause) => cause,
        };
        if self.retries >= self.config.max_retries {
            warn!(
                action = self.action,
                retries = self.retries,
                error = %cause,
                "Giving up after repeated version conflicts"
            );
            return false;
        }

        self.retries += 1;
        debug!(
            action = self.action,
            attempt = self.retries,
            error = %cause,
            "Version conflict, retrying"
        );
        let (observer, action, attempt) = (self.observer, self.action, self.retries);
        notify("on_retry", || observer.on_retry(action, attempt));

        if !self.config.delay.is_zero() {
            tokio::time::sleep(self.config.delay).await;
        }
        true
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::{ConcurrencyError, NullManagerObserver, StoreError};
    use std::time::Duration;

    fn conflict() -> AttemptError {
        CachetError::from(ConcurrencyError::version_mismatch("a", Some(1), Some(2))).into()
    }

    #[test]
    fn test_classification() {
        assert!(matches!(conflict(), AttemptError::Conflict(_)));

        let fatal: AttemptError = CachetError::from(StoreError::LockPoisoned).into();
        assert!(matches!(fatal, AttemptError::Fatal(_)));

        let invalid: AttemptError =
            CachetError::from(ConcurrencyError::InvalidVersion { version: 0 }).into();
        assert!(matches!(invalid, AttemptError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_backoff_stops_at_max_retries() {
        let config = RetryConfig::default()
            .with_max_retries(3)
            .with_delay(Duration::ZERO);
        let mut backoff = Backoff::new("update", &config, &NullManagerObserver);

        let error = conflict();
        assert!(backoff.retry(&error).await);
        assert!(backoff.retry(&error).await);
        assert!(backoff.retry(&error).await);
        assert!(!backoff.retry(&error).await);
        assert_eq!(backoff.retries(), 3);
    }

    #[tokio::test]
    async fn test_backoff_never_retries_fatal() {
        let config = RetryConfig::default();
        let mut backoff = Backoff::new("update", &config, &NullManagerObserver);
        let fatal = AttemptError::Fatal(StoreError::LockPoisoned.into());
        assert!(!backoff.retry(&fatal).await);
        assert_eq!(backoff.retries(), 0);
        assert!(matches!(fatal.into_inner(), CachetError::Store(_)));
    }

    #[tokio::test]
    async fn test_no_retry_config() {
        let config = RetryConfig::none();
        let mut backoff = Backoff::new("delete", &config, &NullManagerObserver);
        assert!(!backoff.retry(&conflict()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_configured_delay() {
        let config = RetryConfig::default().with_delay(Duration::from_millis(100));
        let mut backoff = Backoff::new("update", &config, &NullManagerObserver);

        let started = tokio::time::Instant::now();
        assert!(backoff.retry(&conflict()).await);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
