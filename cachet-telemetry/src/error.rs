//! Telemetry errors

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Failed to register metric {metric}: {reason}")]
    Registration { metric: String, reason: String },

    #[error("Failed to encode metrics: {0}")]
    Encoding(String),

    #[error("Invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = TelemetryError::Registration {
            metric: "cachet_cache_entries".to_string(),
            reason: "duplicate".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cachet_cache_entries"));
        assert!(msg.contains("duplicate"));

        let err = TelemetryError::InvalidFilter {
            filter: "=[".to_string(),
            reason: "bad".to_string(),
        };
        assert!(err.to_string().contains("\"=[\""));
    }
}
