//! Acquisition configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/microscan.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `MICROSCAN_`, using `__` between key
//!    segments so that field names keep their underscores
//!
//! ```text
//! MICROSCAN_APPLICATION__LOG_LEVEL=debug
//! MICROSCAN_RUN__ARRIVAL_TIMEOUT_MS=2500
//! MICROSCAN_RUN__AUTOFOCUS__Z_FINE_STEP=0.5
//! ```
//!
//! Every field has a default, so an empty source set yields a usable configuration.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error_recovery::RetryPolicy;
use crate::focus::metric::MetricWeights;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Sources could not be merged or extracted
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A value is out of range or inconsistent with another
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Acquisition run settings
    pub run: RunConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, coloured when attached to a terminal
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "microscan".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// What to do when the stage does not report arrival in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrivalPolicy {
    /// Skip the point and carry on with the next one
    #[default]
    Skip,
    /// End the run in the error state
    Abort,
}

/// Which detected objects get focused and captured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectPolicy {
    /// Every object surviving the detection filter, in index order
    #[default]
    All,
    /// Only the primary object (largest area, lowest index on ties)
    Primary,
}

/// Per-run configuration handed to the orchestrator at start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Wait after stage arrival before trusting the image
    pub settle_time_ms: u64,
    /// Bound on waiting for stage arrival
    pub arrival_timeout_ms: u64,
    /// Behaviour on arrival timeout
    pub arrival_policy: ArrivalPolicy,
    /// Bound on any single stage, camera, detector or sink call
    pub hardware_timeout_ms: u64,
    /// Detect and focus per object; when false, capture one plain frame per point
    pub autofocus_enabled: bool,
    /// Tick period used by the lifecycle actor
    pub tick_interval_ms: u64,
    /// Which objects to focus
    pub object_policy: ObjectPolicy,
    /// Detection filter
    pub detection: DetectionConfig,
    /// Autofocus scan settings
    pub autofocus: AutofocusConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            settle_time_ms: 200,
            arrival_timeout_ms: 10_000,
            arrival_policy: ArrivalPolicy::Skip,
            hardware_timeout_ms: 5_000,
            autofocus_enabled: true,
            tick_interval_ms: 20,
            object_policy: ObjectPolicy::All,
            detection: DetectionConfig::default(),
            autofocus: AutofocusConfig::default(),
        }
    }
}

/// Detection filter thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Smallest accepted area in pixels
    pub min_area: f64,
    /// Largest accepted area in pixels
    pub max_area: f64,
    /// Minimum circularity in `[0, 1]`
    pub min_circularity: f64,
    /// Minimum short/long side ratio in `[0, 1]`
    pub min_aspect_ratio: f64,
    /// Minimum detector confidence in `[0, 1]`
    pub min_confidence: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_area: 50.0,
            max_area: 1.0e6,
            min_circularity: 0.0,
            min_aspect_ratio: 0.0,
            min_confidence: 0.0,
        }
    }
}

/// Autofocus scan configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusConfig {
    /// Coarse sweep step (actuator units)
    pub z_coarse_step: f64,
    /// Fine sweep step (actuator units)
    pub z_fine_step: f64,
    /// Half-width of the fine sweep around the coarse peak
    pub z_fine_radius: f64,
    /// Settle time after every axial move
    pub focus_settle_ms: u64,
    /// Scores below this are flagged low-confidence
    pub min_focus_score: f64,
    /// Drop low-confidence results instead of capturing them
    pub discard_low_confidence: bool,
    /// Offset from best focus for the optional second frame
    pub secondary_offset: Option<f64>,
    /// Hand secondary frames to the capture sink as well
    pub save_secondary: bool,
    /// Upper bound on samples for one object (coarse + fine)
    pub max_samples_per_object: usize,
    /// Sharpness metric weights
    pub weights: MetricWeights,
    /// Retry policy for actuator moves
    pub retry: RetryPolicy,
    /// Bound on any single actuator or camera call during a scan
    pub hardware_timeout_ms: u64,
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        Self {
            z_coarse_step: 5.0,
            z_fine_step: 1.0,
            z_fine_radius: 5.0,
            focus_settle_ms: 50,
            min_focus_score: 0.0,
            discard_low_confidence: true,
            secondary_offset: None,
            save_secondary: false,
            max_samples_per_object: 500,
            weights: MetricWeights::default(),
            retry: RetryPolicy::default(),
            hardware_timeout_ms: 5_000,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ScopeConfig {
    /// Load configuration from `config/microscan.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/microscan.toml")
    }

    /// Load configuration from a specific file path plus environment overrides.
    ///
    /// A missing file is treated as empty. The result is validated before it is
    /// returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MICROSCAN_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        self.run.validate()
    }
}

impl RunConfig {
    /// Bound on one stage, camera, detector or sink call.
    pub fn hardware_timeout(&self) -> Duration {
        Duration::from_millis(self.hardware_timeout_ms)
    }

    /// Checks every bound a run depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arrival_timeout_ms == 0 {
            return Err(invalid("arrival_timeout_ms must be greater than 0"));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms must be greater than 0"));
        }
        if self.hardware_timeout_ms == 0 {
            return Err(invalid("hardware_timeout_ms must be greater than 0"));
        }
        self.detection.validate()?;
        self.autofocus.validate()
    }
}

impl DetectionConfig {
    /// Checks area and ratio bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_area.is_finite() || !self.max_area.is_finite() || self.min_area < 0.0 {
            return Err(invalid("min_area/max_area must be finite and non-negative"));
        }
        if self.min_area > self.max_area {
            return Err(invalid(format!(
                "min_area {} exceeds max_area {}",
                self.min_area, self.max_area
            )));
        }
        for (name, value) in [
            ("min_circularity", self.min_circularity),
            ("min_aspect_ratio", self.min_aspect_ratio),
            ("min_confidence", self.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        Ok(())
    }
}

impl AutofocusConfig {
    /// Bound on one actuator or camera call.
    pub fn hardware_timeout(&self) -> Duration {
        Duration::from_millis(self.hardware_timeout_ms)
    }

    /// Checks scan geometry and the sample cap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("z_coarse_step", self.z_coarse_step),
            ("z_fine_step", self.z_fine_step),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(format!("{name} must be positive, got {value}")));
            }
        }
        if !self.z_fine_radius.is_finite() || self.z_fine_radius < 0.0 {
            return Err(invalid(format!(
                "z_fine_radius must be non-negative, got {}",
                self.z_fine_radius
            )));
        }
        if self.z_fine_step > self.z_coarse_step {
            return Err(invalid("z_fine_step must not exceed z_coarse_step"));
        }
        if !self.min_focus_score.is_finite() {
            return Err(invalid("min_focus_score must be finite"));
        }
        if matches!(self.secondary_offset, Some(o) if !o.is_finite()) {
            return Err(invalid("secondary_offset must be finite"));
        }
        if self.max_samples_per_object == 0 {
            return Err(invalid("max_samples_per_object must be greater than 0"));
        }
        if self.hardware_timeout_ms == 0 {
            return Err(invalid("autofocus hardware_timeout_ms must be greater than 0"));
        }
        self.weights.validate().map_err(invalid)
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ScopeConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_area_bounds() {
        let mut config = RunConfig::default();
        config.detection.min_area = 500.0;
        config.detection.max_area = 10.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds max_area"));
    }

    #[test]
    fn rejects_non_positive_steps() {
        let mut config = RunConfig::default();
        config.autofocus.z_coarse_step = 0.0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.autofocus.z_fine_step = 10.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_hardware_timeouts() {
        let mut config = RunConfig::default();
        config.hardware_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.autofocus.hardware_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = ScopeConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn policies_use_snake_case() {
        let toml = toml::to_string(&RunConfig::default()).unwrap();
        assert!(toml.contains("arrival_policy = \"skip\""));
        assert!(toml.contains("object_policy = \"all\""));
    }
}
