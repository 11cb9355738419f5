//! Slow-operation guard

use std::time::{Duration, Instant};

/// Scoped timer that logs a warning on drop when the scope ran too long.
///
/// ```ignore
/// let _guard = TimeGuard::new("widgets.update", settings.slow_operation_threshold);
/// store.update(entity).await?;
/// ```
#[derive(Debug)]
pub struct TimeGuard {
    caller: String,
    threshold: Duration,
    started: Instant,
}

impl TimeGuard {
    pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(5);

    pub fn new(caller: impl Into<String>, threshold: Duration) -> Self {
        Self {
            caller: caller.into(),
            threshold,
            started: Instant::now(),
        }
    }

    pub fn with_default_threshold(caller: impl Into<String>) -> Self {
        Self::new(caller, Self::DEFAULT_THRESHOLD)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn exceeded(&self) -> bool {
        self.elapsed() > self.threshold
    }
}

impl Drop for TimeGuard {
    fn drop(&mut self) {
        let elapsed = self.elapsed();
        if elapsed > self.threshold {
            tracing::warn!(
                caller = %self.caller,
                threshold_ms = self.threshold.as_millis() as u64,
                elapsed_ms = elapsed.as_millis() as u64,
                "Operation took longer than threshold"
            );
        }
    }
}
