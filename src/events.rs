//! Typed acquisition events.
//!
//! Events are one-way notifications fanned out over a `tokio::sync::broadcast`
//! channel. Sending never blocks and never fails the run: with no subscribers the
//! event is simply dropped, and a lagging subscriber loses the oldest events.

use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::orchestrator::RunSummary;

/// Default broadcast capacity.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Why a trajectory point produced no capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Stage did not report arrival within `arrival_timeout_ms`
    ArrivalTimeout,
    /// Detector found nothing that passed the filter
    NoObjects,
    /// Stage rejected or failed a command
    StageFault(String),
    /// Detector failed; its output was discarded
    DetectionFailed(String),
    /// No frame could be read
    FrameUnavailable(String),
    /// The autofocus engine could not run at this point
    AutofocusUnavailable(String),
}

impl SkipReason {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ArrivalTimeout => "arrival_timeout",
            SkipReason::NoObjects => "no_objects",
            SkipReason::StageFault(_) => "stage_fault",
            SkipReason::DetectionFailed(_) => "detection_failed",
            SkipReason::FrameUnavailable(_) => "frame_unavailable",
            SkipReason::AutofocusUnavailable(_) => "autofocus_unavailable",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the acquisition core reports while it runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AcquisitionEvent {
    /// A run was accepted and begins with point 0
    RunStarted {
        /// Run identifier
        run_id: Uuid,
        /// Trajectory length
        total_points: usize,
    },
    /// The stage was commanded to a point
    PointStarted {
        /// Trajectory index
        index: usize,
        /// Target X (micrometers)
        x_um: f64,
        /// Target Y (micrometers)
        y_um: f64,
    },
    /// A point finished normally
    PointCompleted {
        /// Trajectory index
        index: usize,
        /// Objects handed to autofocus (0 in plain-capture mode)
        object_count: usize,
        /// Frames accepted by the capture sink
        captured_count: usize,
    },
    /// A point was skipped
    PointSkipped {
        /// Trajectory index
        index: usize,
        /// Why
        reason: SkipReason,
    },
    /// One focus sample was scored
    AutofocusProgress {
        /// Object being focused
        object_index: usize,
        /// Axial position sampled
        position: f64,
        /// Score at that position
        score: f64,
    },
    /// Autofocus gave up on one object; the engine moved on to the next
    AutofocusFailed {
        /// Object that failed
        object_index: usize,
        /// Failure description
        reason: String,
    },
    /// Every point was processed
    RunCompleted(RunSummary),
    /// `stop()` ended the run
    RunStopped(RunSummary),
    /// The run ended in the error state
    RunError {
        /// Point at which the run aborted
        index: usize,
        /// What went wrong
        reason: SkipReason,
        /// Counters at abort time
        summary: RunSummary,
    },
}

/// Sending half shared by the orchestrator and the autofocus worker.
pub type EventSender = broadcast::Sender<AcquisitionEvent>;

/// Send without caring whether anyone is listening.
pub(crate) fn emit(tx: &EventSender, event: AcquisitionEvent) {
    let _ = tx.send(event);
}
