//! Core library for the microscan acquisition system.
//!
//! Walks a motorized microscope stage over a trajectory, detects objects at each
//! position, focuses each object with a coarse-to-fine masked-sharpness search and
//! hands the captured frames to a sink. Hardware is reached only through the
//! capability traits in [`hardware::capabilities`]; [`hardware::mock`] provides
//! simulated devices for tests and the `microscan simulate` command.

pub mod config;
pub mod core;
pub mod detection;
pub mod error;
pub mod error_recovery;
pub mod events;
pub mod focus;
pub mod hardware;
pub mod logging;
pub mod orchestrator;

pub use error::{AppResult, ScopeError};
pub use orchestrator::{AcquisitionActor, AcquisitionHandle, MicroscopyOrchestrator};
