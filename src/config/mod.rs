//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - JSON loading (text or file)
//! - Defaults for every field
//! - Conversion into the engine's filter, extractor and correlator settings

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::correlator::CorrelatorConfig;
use crate::engine::extractors::{FieldPaths, RecordExtractor};
use crate::engine::filters::{DEFAULT_ENDPOINT_PATTERNS, EndpointFilter, FilterError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Pattern(#[from] FilterError),
}

/// Engine configuration. Every field has a default, so a partial JSON
/// document is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Regular expressions selecting monitored endpoints.
    pub endpoint_patterns: Vec<String>,
    pub max_exchanges: usize,
    pub exchange_max_age_ms: u64,
    pub eviction_interval_ms: u64,
    pub settle_ms: u64,
    pub settle_jitter_ms: u64,
    pub navigation_timeout_ms: u64,
    /// Object that must exist in a payload before it counts as a record.
    /// Empty disables the check.
    pub record_root: String,
    pub field_paths: FieldPaths,
    pub enable_metrics: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let correlator = CorrelatorConfig::default();
        Self {
            endpoint_patterns: DEFAULT_ENDPOINT_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            max_exchanges: correlator.max_exchanges,
            exchange_max_age_ms: duration_ms(correlator.max_age),
            eviction_interval_ms: 1_000,
            settle_ms: 10_000,
            settle_jitter_ms: 0,
            navigation_timeout_ms: 60_000,
            record_root: "item".into(),
            field_paths: FieldPaths::default(),
            enable_metrics: true,
        }
    }
}

impl CaptureConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn endpoint_filter(&self) -> Result<EndpointFilter, ConfigError> {
        Ok(EndpointFilter::new(self.endpoint_patterns.iter().cloned())?)
    }

    pub fn record_extractor(&self) -> RecordExtractor {
        RecordExtractor::new(self.field_paths.clone())
            .with_required_root(Some(self.record_root.clone()))
    }

    pub fn correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            max_exchanges: self.max_exchanges,
            max_age: Duration::from_millis(self.exchange_max_age_ms),
        }
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn settle_jitter(&self) -> Duration {
        Duration::from_millis(self.settle_jitter_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
