//! Custom error types for the application.
//!
//! This module defines the primary error type, `ScopeError`, surfaced synchronously by
//! the lifecycle API. Using the `thiserror` crate, it provides one place for the
//! failures that stop a run from starting at all.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically related to file parsing or
//!   type mismatches in the configuration sources.
//! - **`Configuration`**: Semantic errors that pass parsing but are logically wrong
//!   (empty trajectory, `min_area > max_area`, non-positive scan steps). Caught by the
//!   validation step, before any hardware is touched.
//! - **`MissingCollaborator`**: A required hardware handle was never supplied. Fatal;
//!   the run never starts.
//! - **`RunInProgress`** / **`HardwareBusy`**: Lifecycle conflicts. The focus rig is owned
//!   exclusively, so a new run cannot start while a cancelled autofocus job still
//!   holds it.
//! - **`Hardware`**: Collaborator failures that escape to the caller (only from
//!   explicit helper calls; per-point failures are converted to skip events instead).
//!
//! Per-point and per-object failures never unwind through this type. They are caught
//! where they happen and become [`crate::events::AcquisitionEvent`]s.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ScopeError>;

/// Errors surfaced synchronously by the acquisition lifecycle.
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Configuration sources could not be parsed or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A hardware handle required for this run was not provided.
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// `start` was called while a run is still active.
    #[error("A run is already in progress")]
    RunInProgress,

    /// The focus rig is still held by a winding-down autofocus job.
    #[error("Focus hardware is still owned by an autofocus job")]
    HardwareBusy,

    /// A collaborator call failed outside of a run.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// The lifecycle actor has shut down.
    #[error("Acquisition actor is no longer running")]
    ActorGone,
}

impl From<crate::config::ConfigError> for ScopeError {
    fn from(err: crate::config::ConfigError) -> Self {
        match err {
            crate::config::ConfigError::LoadError(e) => ScopeError::Config(e),
            crate::config::ConfigError::ValidationError(msg) => ScopeError::Configuration(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScopeError::MissingCollaborator("focus actuator");
        assert_eq!(err.to_string(), "Missing collaborator: focus actuator");
    }

    #[test]
    fn test_validation_error_converts() {
        let err: ScopeError =
            crate::config::ConfigError::ValidationError("min_area > max_area".into()).into();
        assert!(matches!(err, ScopeError::Configuration(ref m) if m.contains("min_area")));
    }
}
