//! Orchestrator state, counters and status snapshots.

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Trajectory state machine.
///
/// ```text
/// Idle -> MovingToPoint -> WaitingArrival -> Settling -> Detecting -> Focusing
///      -> Capturing -> Advancing -> (MovingToPoint | Completed)
/// ```
///
/// `Settling -> Capturing` when autofocus is disabled, `Detecting -> Advancing` when
/// nothing was found, and any per-point hardware fault passes through `Error` on its
/// way to `Advancing`. `Error` is terminal only when the arrival policy aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeState {
    /// No run started yet
    Idle,
    /// Stage move is being commanded
    MovingToPoint,
    /// Polling the stage for arrival
    WaitingArrival,
    /// Post-arrival settle wait
    Settling,
    /// Reading a frame and running the detector
    Detecting,
    /// Autofocus job owns the focus rig
    Focusing,
    /// Handing frames to the capture sink
    Capturing,
    /// Reporting the point and moving the index on
    Advancing,
    /// Every point was processed
    Completed,
    /// `stop()` was called
    Stopped,
    /// A point failed; see [`RunStatus::finished`] for whether the run aborted
    Error,
}

impl ScopeState {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeState::Idle => "idle",
            ScopeState::MovingToPoint => "moving_to_point",
            ScopeState::WaitingArrival => "waiting_arrival",
            ScopeState::Settling => "settling",
            ScopeState::Detecting => "detecting",
            ScopeState::Focusing => "focusing",
            ScopeState::Capturing => "capturing",
            ScopeState::Advancing => "advancing",
            ScopeState::Completed => "completed",
            ScopeState::Stopped => "stopped",
            ScopeState::Error => "error",
        }
    }
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run counters, reported with every terminal event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Points that reached `Advancing`, skipped ones included
    pub points_processed: usize,
    /// Points that produced no capture attempt
    pub points_skipped: usize,
    /// Objects the autofocus engine returned a result for
    pub objects_focused: usize,
    /// Objects the autofocus engine gave up on
    pub autofocus_failures: usize,
    /// Frames accepted by the capture sink
    pub images_captured: usize,
    /// Focus results dropped for scoring below `min_focus_score`
    pub low_confidence_discarded: usize,
    /// Frames the capture sink rejected
    pub capture_failures: usize,
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    /// Current machine state
    pub state: ScopeState,
    /// Current trajectory index (equals `total` once completed)
    pub index: usize,
    /// Trajectory length
    pub total: usize,
    /// Whether the run has ended and the state will not change on further ticks
    pub finished: bool,
    /// Identifier of the current or last run
    pub run_id: Option<Uuid>,
    /// Counters so far
    pub summary: RunSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_snake_case() {
        assert_eq!(ScopeState::WaitingArrival.to_string(), "waiting_arrival");
        assert_eq!(
            serde_json::to_value(ScopeState::MovingToPoint).unwrap(),
            "moving_to_point"
        );
    }
}
