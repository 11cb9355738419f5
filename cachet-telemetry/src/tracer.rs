//! Tracing subscriber initialization
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a
//! human-readable or JSON `fmt` layer.

use crate::error::{TelemetryError, TelemetryResult};
use cachet_core::{CachetResult, ConfigError};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Reported in the startup log line.
    pub service_name: String,
    /// `EnvFilter` directives, e.g. `cachet_storage=debug,info`.
    pub log_filter: String,
    /// Emit one JSON object per event instead of plain text.
    pub json_logs: bool,
    /// Whether callers should install the Prometheus observers.
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "cachet".to_string(),
            log_filter: DEFAULT_FILTER.to_string(),
            json_logs: false,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }

    /// Environment variables:
    /// - `CACHET_SERVICE_NAME` (default: cachet)
    /// - `CACHET_LOG`, then `RUST_LOG` (default: info)
    /// - `CACHET_LOG_JSON` (default: false)
    /// - `CACHET_METRICS_ENABLED` (default: true)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
                .unwrap_or(default)
        };
        Self {
            service_name: lookup("CACHET_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_filter: lookup("CACHET_LOG")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or(defaults.log_filter),
            json_logs: flag("CACHET_LOG_JSON", defaults.json_logs),
            metrics_enabled: flag("CACHET_METRICS_ENABLED", defaults.metrics_enabled),
        }
    }

    pub fn validate(&self) -> CachetResult<()> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "service_name".to_string(),
            }
            .into());
        }
        if let Err(e) = EnvFilter::try_new(&self.log_filter) {
            return Err(ConfigError::InvalidValue {
                field: "log_filter".to_string(),
                value: self.log_filter.clone(),
                reason: e.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Install the global tracing subscriber.
///
/// Fails if the filter does not parse or a global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> TelemetryResult<()> {
    let filter =
        EnvFilter::try_new(&config.log_filter).map_err(|e| TelemetryError::InvalidFilter {
            filter: config.log_filter.clone(),
            reason: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json_logs {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    installed.map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    tracing::info!(
        service_name = %config.service_name,
        json_logs = config.json_logs,
        metrics_enabled = config.metrics_enabled,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config, TelemetryConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let config = TelemetryConfig::from_lookup(lookup_from(&[
            ("CACHET_SERVICE_NAME", "orders"),
            ("RUST_LOG", "warn"),
            ("CACHET_LOG_JSON", "true"),
            ("CACHET_METRICS_ENABLED", "0"),
        ]));
        assert_eq!(config.service_name, "orders");
        assert_eq!(config.log_filter, "warn");
        assert!(config.json_logs);
        assert!(!config.metrics_enabled);
    }

    #[test]
    fn test_cachet_log_wins_over_rust_log() {
        let config = TelemetryConfig::from_lookup(lookup_from(&[
            ("RUST_LOG", "warn"),
            ("CACHET_LOG", "cachet_storage=debug"),
        ]));
        assert_eq!(config.log_filter, "cachet_storage=debug");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = TelemetryConfig::default().with_service_name("  ");
        assert!(config.validate().is_err());

        let config = TelemetryConfig::default().with_log_filter("cachet=loud");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_init_rejects_bad_filter() {
        let config = TelemetryConfig::default().with_log_filter("cachet=loud");
        assert!(matches!(
            init_tracing(&config),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_init_twice_fails() {
        let config = TelemetryConfig::default().with_json_logs(true);
        let _ = init_tracing(&config);
        assert!(matches!(
            init_tracing(&config),
            Err(TelemetryError::Subscriber(_))
        ));
    }
}
