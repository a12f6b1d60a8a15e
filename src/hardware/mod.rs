//! Hardware collaborators: capability traits and simulated devices.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    CaptureKind, CaptureMetadata, CaptureSink, FocusActuator, FocusRig, FrameSource,
    ObjectDetector, ScopeHardware, Stage,
};
