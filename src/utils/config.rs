use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::core::constants::{DEFAULT_MAX_SIGNAL, DEFAULT_TOLERANCE, TIME_TOLERANCE};

/// Tuning parameters of the locator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Register cross-sensor contacts as checkpoints on the contacted sensor
    pub checkpoints: bool,
    /// Split voyages whose cross-sensor contact is geometrically impossible
    pub path_rectification: bool,
    /// Initial co-location signal ceiling, raised by stronger readings at runtime
    pub max_signal: f64,
    /// Tolerance with respect to `max_signal`
    pub tolerance: f64,
    /// Clock skew allowed between sensors (ticks)
    pub time_tolerance: u64,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            checkpoints: true,
            path_rectification: true,
            max_signal: DEFAULT_MAX_SIGNAL,
            tolerance: DEFAULT_TOLERANCE,
            time_tolerance: TIME_TOLERANCE,
        }
    }
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value} for {parameter}: {reason}")]
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },

    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LocatorConfig {
    /// Engine without cross-sensor corrections
    pub fn minimal() -> Self {
        Self {
            checkpoints: false,
            path_rectification: false,
            ..Self::default()
        }
    }

    pub fn with_checkpoints(mut self, enabled: bool) -> Self {
        self.checkpoints = enabled;
        self
    }

    pub fn with_path_rectification(mut self, enabled: bool) -> Self {
        self.path_rectification = enabled;
        self
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: LocatorConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file, missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path_str,
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.max_signal.is_finite() || self.max_signal <= 0.0 {
            return Err(ConfigError::InvalidParameter {
                parameter: "max_signal".to_string(),
                value: self.max_signal.to_string(),
                reason: "must be a positive signal strength".to_string(),
            });
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 || self.tolerance >= self.max_signal {
            return Err(ConfigError::InvalidParameter {
                parameter: "tolerance".to_string(),
                value: self.tolerance.to_string(),
                reason: format!("must lie in [0, {})", self.max_signal),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LocatorConfig::default();
        assert!(config.checkpoints);
        assert!(config.path_rectification);
        assert_eq!(config.max_signal, 0.9);
        assert_eq!(config.tolerance, 0.1);
        assert_eq!(config.time_tolerance, 3);
        assert!(config.validate().is_ok());

        let minimal = LocatorConfig::minimal();
        assert!(!minimal.checkpoints && !minimal.path_rectification);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = LocatorConfig::from_json_str(r#"{"checkpoints": false, "tolerance": 0.05}"#).unwrap();
        assert!(!config.checkpoints);
        assert!(config.path_rectification);
        assert_eq!(config.tolerance, 0.05);
    }

    #[test]
    fn test_invalid_parameters() {
        let err = LocatorConfig::from_json_str(r#"{"max_signal": -1.0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { ref parameter, .. } if parameter == "max_signal"));

        let config = LocatorConfig {
            tolerance: 2.0,
            ..LocatorConfig::default()
        };
        assert!(config.validate().is_err());

        assert!(matches!(
            LocatorConfig::from_json_str("{not json"),
            Err(ConfigError::Serialization(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("relay-locator-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"path_rectification": false}"#).unwrap();
        let config = LocatorConfig::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(!config.path_rectification);
        assert!(config.checkpoints);

        assert!(matches!(
            LocatorConfig::from_file("/nonexistent/relay-locator.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
