//! Hardware capability traits.
//!
//! The acquisition core never speaks a wire protocol. It drives the microscope through
//! these capability traits and leaves the protocol details to implementations:
//!
//! - [`Stage`] - XY positioning with polled arrival (micrometers)
//! - [`FocusActuator`] - axial (Z) positioning with bounded latency
//! - [`FrameSource`] - latest camera readout
//! - [`ObjectDetector`] - opaque detector model, shared across consumers
//! - [`CaptureSink`] - persists a captured frame
//!
//! The focus actuator and the frame source together form a [`FocusRig`]. The rig is
//! owned by exactly one component at a time and handed over by move, so a frame can
//! only ever be read by whoever is currently commanding the focus axis.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::core::Frame;
use crate::detection::RawDetection;

/// Capability for XY sample stages.
///
/// Moves are asynchronous: `move_to` returns once the command is accepted and
/// arrival is observed by polling `is_at_target`.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Command a move to absolute `(x, y)` micrometers.
    async fn move_to(&self, x_um: f64, y_um: f64) -> Result<()>;

    /// Whether the last commanded target has been reached within tolerance.
    async fn is_at_target(&self) -> Result<bool>;

    /// Halt motion and hold position.
    async fn stop(&self) -> Result<()>;
}

/// Capability for the axial focus drive.
#[async_trait]
pub trait FocusActuator: Send + Sync {
    /// Move to absolute axial position `z`. Returns once the move completed.
    async fn move_to(&self, z: f64) -> Result<()>;

    /// Current axial position.
    async fn read_position(&self) -> Result<f64>;

    /// Full travel `(min, max)` in actuator units.
    async fn travel_range(&self) -> Result<(f64, f64)>;
}

/// Capability for anything that can hand out the latest camera frame.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Latest frame. May be stale by at most one readout interval.
    async fn current_frame(&self) -> Result<Frame>;
}

/// Capability for object detectors. One instance is constructed per session and
/// shared by reference with every consumer.
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    /// Run the detector over a frame. Output is normalized by
    /// [`crate::detection::DetectionAdapter`].
    async fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>>;
}

/// Capability for persisting captured frames.
#[async_trait]
pub trait CaptureSink: Send + Sync {
    /// Persist `frame`, returning where it went.
    async fn save(&self, frame: &Frame, metadata: &CaptureMetadata) -> Result<PathBuf>;
}

/// What kind of capture a saved frame is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// Frame taken at an object's best-focus position
    Focused,
    /// Frame taken at best focus plus the configured secondary offset
    Secondary,
    /// Plain frame taken with autofocus disabled
    Plain,
}

/// Metadata passed to the sink with every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Run identifier
    pub run_id: Uuid,
    /// Trajectory point index
    pub point_index: usize,
    /// Stage X at capture (micrometers)
    pub stage_x_um: f64,
    /// Stage Y at capture (micrometers)
    pub stage_y_um: f64,
    /// Detected object index, if the capture belongs to one
    pub object_index: Option<usize>,
    /// Axial position the frame was captured at, if known
    pub z_position: Option<f64>,
    /// Sharpness score at `z_position`
    pub focus_score: Option<f64>,
    /// Score fell below the configured minimum
    pub low_confidence: bool,
    /// Capture kind
    pub kind: CaptureKind,
    /// Wall-clock time the sink was called
    pub captured_at: DateTime<Utc>,
}

/// Exclusively-owned imaging hardware: the focus drive plus the camera feed.
///
/// Moved into the autofocus engine for one job and handed back in the job outcome.
/// The actuator is optional only so that a missing drive can be reported at start
/// instead of at construction.
pub struct FocusRig {
    /// Axial drive, if fitted
    pub actuator: Option<Box<dyn FocusActuator>>,
    /// Camera feed
    pub frames: Box<dyn FrameSource>,
}

impl FocusRig {
    /// Rig with both a focus drive and a camera.
    pub fn new(actuator: Box<dyn FocusActuator>, frames: Box<dyn FrameSource>) -> Self {
        Self {
            actuator: Some(actuator),
            frames,
        }
    }

    /// Camera-only rig; autofocus will refuse to start on it.
    pub fn without_actuator(frames: Box<dyn FrameSource>) -> Self {
        Self {
            actuator: None,
            frames,
        }
    }
}

impl fmt::Debug for FocusRig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FocusRig")
            .field("has_actuator", &self.actuator.is_some())
            .finish()
    }
}

/// Every collaborator an orchestrator may need, supplied up front.
///
/// Missing handles are not an error until a run that needs them is started.
#[derive(Default)]
pub struct ScopeHardware {
    /// XY stage
    pub stage: Option<Box<dyn Stage>>,
    /// Focus drive
    pub focus: Option<Box<dyn FocusActuator>>,
    /// Camera feed
    pub frames: Option<Box<dyn FrameSource>>,
    /// Shared detector
    pub detector: Option<std::sync::Arc<dyn ObjectDetector>>,
    /// Capture sink
    pub sink: Option<std::sync::Arc<dyn CaptureSink>>,
}

impl ScopeHardware {
    /// Empty set of collaborators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the XY stage.
    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stage = Some(Box::new(stage));
        self
    }

    /// Attach the focus drive.
    pub fn with_focus(mut self, focus: impl FocusActuator + 'static) -> Self {
        self.focus = Some(Box::new(focus));
        self
    }

    /// Attach the camera feed.
    pub fn with_frames(mut self, frames: impl FrameSource + 'static) -> Self {
        self.frames = Some(Box::new(frames));
        self
    }

    /// Attach the shared detector.
    pub fn with_detector(mut self, detector: std::sync::Arc<dyn ObjectDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Attach the capture sink.
    pub fn with_sink(mut self, sink: std::sync::Arc<dyn CaptureSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl fmt::Debug for ScopeHardware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeHardware")
            .field("stage", &self.stage.is_some())
            .field("focus", &self.focus.is_some())
            .field("frames", &self.frames.is_some())
            .field("detector", &self.detector.is_some())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
