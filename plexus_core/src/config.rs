use serde::{Deserialize, Serialize};

use crate::error::PlexusError;

pub const DEFAULT_NESTING_LIMIT: usize = 250;
pub const DEFAULT_GC_THRESHOLD: usize = 4096;

/// Tunables for a [`Runtime`](crate::Runtime). Missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub workers: usize,
    pub recycle_limit: usize,
    pub nesting_limit: usize,
    /// Allocations between garbage collections in process isolates.
    pub gc_threshold: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            recycle_limit: 0,
            nesting_limit: DEFAULT_NESTING_LIMIT,
            gc_threshold: DEFAULT_GC_THRESHOLD,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, PlexusError> {
        let config: RuntimeConfig =
            serde_json::from_str(json).map_err(|e| PlexusError::Configuration(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PlexusError> {
        if self.workers == 0 {
            return Err(PlexusError::Configuration("number of workers must be positive".to_string()));
        }
        if self.nesting_limit == 0 {
            return Err(PlexusError::Configuration("nesting limit must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = RuntimeConfig::from_json_str(r#"{ "workers": 3, "recycle_limit": 8 }"#).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.recycle_limit, 8);
        assert_eq!(config.nesting_limit, DEFAULT_NESTING_LIMIT);
        assert_eq!(config.gc_threshold, DEFAULT_GC_THRESHOLD);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = RuntimeConfig::from_json_str(r#"{ "workers": 0 }"#).unwrap_err();
        assert_eq!(err.to_string(), "number of workers must be positive");
    }

    #[test]
    fn test_malformed_json_is_configuration_error() {
        assert!(matches!(
            RuntimeConfig::from_json_str("{ workers"),
            Err(PlexusError::Configuration(_))
        ));
    }
}
