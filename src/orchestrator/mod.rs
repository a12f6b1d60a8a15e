//! Trajectory state machine.
//!
//! [`MicroscopyOrchestrator`] walks a [`Trajectory`] one tick at a time. Each call to
//! [`MicroscopyOrchestrator::tick`] performs at most one transition's worth of work and
//! never waits on anything open-ended: arrival is polled against a deadline, settling
//! is a deadline check, and autofocus runs on the engine's own worker while the tick
//! only checks whether it has finished.
//!
//! The focus rig (actuator plus camera) lives here between points. For the duration
//! of a focus job it is moved into the engine and comes back with the outcome, so
//! nothing in this module can read a frame while the engine is driving the axis.
//!
//! Every per-point failure is turned into a [`SkipReason`] and reported with
//! `PointSkipped`; only a misconfigured start is returned as an error.

pub mod actor;
pub mod state;

pub use actor::{AcquisitionActor, AcquisitionHandle, ScopeCommand};
pub use state::{RunStatus, RunSummary, ScopeState};

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ArrivalPolicy, ObjectPolicy, RunConfig};
use crate::core::{DetectedObject, Frame, Trajectory, TrajectoryPoint};
use crate::detection::{primary, DetectionAdapter};
use crate::error::{AppResult, ScopeError};
use crate::error_recovery::with_timeout;
use crate::events::{emit, AcquisitionEvent, EventSender, SkipReason, EVENT_CHANNEL_CAPACITY};
use crate::focus::{AutofocusEngine, AutofocusJob, AutofocusResult};
use crate::hardware::capabilities::{
    CaptureKind, CaptureMetadata, CaptureSink, FocusRig, ObjectDetector, ScopeHardware, Stage,
};

/// Bound on a stage stop issued outside a run's configuration.
const DEFAULT_HARDWARE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-point bookkeeping, reset on every advance.
#[derive(Debug, Default)]
struct PointTally {
    object_count: usize,
    captured: usize,
    skip: Option<SkipReason>,
}

/// Frames waiting for the capture sink.
enum PendingCapture {
    Plain(Frame),
    Focused(Vec<AutofocusResult>),
}

/// Mutable state of one run.
struct Session {
    run_id: Uuid,
    trajectory: Trajectory,
    config: RunConfig,
    index: usize,
    summary: RunSummary,
    deadline: Option<Instant>,
    objects: Vec<DetectedObject>,
    focus_job: Option<AutofocusJob>,
    pending: Option<PendingCapture>,
    fault: Option<SkipReason>,
    tally: PointTally,
    finished: bool,
    detection: Option<DetectionAdapter>,
    engine: AutofocusEngine,
}

impl Session {
    fn point(&self) -> Option<TrajectoryPoint> {
        self.trajectory.get(self.index).copied()
    }

    fn metadata(
        &self,
        kind: CaptureKind,
        object_index: Option<usize>,
        z_position: Option<f64>,
        focus_score: Option<f64>,
        low_confidence: bool,
    ) -> CaptureMetadata {
        let (stage_x_um, stage_y_um) = self
            .point()
            .map_or((f64::NAN, f64::NAN), |p| (p.x_um, p.y_um));
        CaptureMetadata {
            run_id: self.run_id,
            point_index: self.index,
            stage_x_um,
            stage_y_um,
            object_index,
            z_position,
            focus_score,
            low_confidence,
            kind,
            captured_at: Utc::now(),
        }
    }
}

/// Top-level acquisition state machine.
pub struct MicroscopyOrchestrator {
    stage: Option<Box<dyn Stage>>,
    rig: Option<FocusRig>,
    has_frames: bool,
    has_focus: bool,
    detector: Option<Arc<dyn ObjectDetector>>,
    sink: Option<Arc<dyn CaptureSink>>,
    events: EventSender,
    state: ScopeState,
    session: Option<Session>,
}

impl std::fmt::Debug for MicroscopyOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroscopyOrchestrator")
            .field("state", &self.state)
            .field("rig", &self.rig)
            .finish_non_exhaustive()
    }
}

impl MicroscopyOrchestrator {
    /// Takes ownership of the collaborators. Missing ones are reported by `start`.
    pub fn new(hardware: ScopeHardware) -> Self {
        let ScopeHardware {
            stage,
            focus,
            frames,
            detector,
            sink,
        } = hardware;
        let has_frames = frames.is_some();
        let has_focus = focus.is_some();
        let rig = frames.map(|frames| FocusRig {
            actuator: focus,
            frames,
        });
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            stage,
            rig,
            has_frames,
            has_focus,
            detector,
            sink,
            events,
            state: ScopeState::Idle,
            session: None,
        }
    }

    /// New receiver for acquisition events.
    pub fn subscribe(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.events.subscribe()
    }

    /// Current machine state.
    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// State, position and counters.
    pub fn status(&self) -> RunStatus {
        let stopped = self.state == ScopeState::Stopped;
        match &self.session {
            Some(s) => RunStatus {
                state: self.state,
                index: s.index,
                total: s.trajectory.len(),
                finished: s.finished || stopped,
                run_id: Some(s.run_id),
                summary: s.summary,
            },
            None => RunStatus {
                state: self.state,
                index: 0,
                total: 0,
                finished: stopped,
                run_id: None,
                summary: RunSummary::default(),
            },
        }
    }

    /// Begin a run at point 0.
    ///
    /// Rejected synchronously, with nothing moved, if a run is active, the
    /// configuration is invalid, a collaborator this run needs is missing, or the focus
    /// rig is still held by the cancelled job of a previous run.
    pub async fn start(&mut self, trajectory: Trajectory, config: RunConfig) -> AppResult<Uuid> {
        if self.session.as_ref().is_some_and(|s| !s.finished) {
            return Err(ScopeError::RunInProgress);
        }
        config.validate()?;
        if trajectory.is_empty() {
            return Err(ScopeError::Configuration("trajectory is empty".into()));
        }
        if self.stage.is_none() {
            return Err(ScopeError::MissingCollaborator("stage"));
        }
        if !self.has_frames {
            return Err(ScopeError::MissingCollaborator("frame source"));
        }
        if self.sink.is_none() {
            return Err(ScopeError::MissingCollaborator("capture sink"));
        }
        if config.autofocus_enabled {
            if self.detector.is_none() {
                return Err(ScopeError::MissingCollaborator("object detector"));
            }
            if !self.has_focus {
                return Err(ScopeError::MissingCollaborator("focus actuator"));
            }
        }
        self.reclaim_rig().await;
        if self.rig.is_none() {
            return Err(ScopeError::HardwareBusy);
        }

        let run_id = Uuid::new_v4();
        let engine =
            AutofocusEngine::new(config.autofocus.clone()).with_events(self.events.clone());
        let detection = self
            .detector
            .as_ref()
            .map(|d| DetectionAdapter::new(config.detection.clone(), Arc::clone(d)));
        let total = trajectory.len();

        self.session = Some(Session {
            run_id,
            trajectory,
            config,
            index: 0,
            summary: RunSummary::default(),
            deadline: None,
            objects: Vec::new(),
            focus_job: None,
            pending: None,
            fault: None,
            tally: PointTally::default(),
            finished: false,
            detection,
            engine,
        });
        self.state = ScopeState::MovingToPoint;

        info!(%run_id, total_points = total, "Acquisition run started");
        emit(
            &self.events,
            AcquisitionEvent::RunStarted {
                run_id,
                total_points: total,
            },
        );
        Ok(run_id)
    }

    /// Advance the state machine by at most one transition.
    pub async fn tick(&mut self) -> ScopeState {
        let Some(mut session) = self.session.take() else {
            return self.state;
        };
        if session.finished {
            self.session = Some(session);
            if self.state == ScopeState::Stopped {
                self.reclaim_rig().await;
            }
            return self.state;
        }

        let next = match self.state {
            ScopeState::MovingToPoint => self.begin_point(&mut session).await,
            ScopeState::WaitingArrival => self.poll_arrival(&mut session).await,
            ScopeState::Settling => self.settle(&mut session).await,
            ScopeState::Detecting => self.detect(&mut session).await,
            ScopeState::Focusing => self.poll_focus(&mut session).await,
            ScopeState::Capturing => self.capture(&mut session).await,
            ScopeState::Advancing => self.advance(&mut session),
            ScopeState::Error => self.handle_fault(&mut session).await,
            ScopeState::Idle | ScopeState::Completed | ScopeState::Stopped => self.state,
        };
        if next != self.state {
            debug!(from = %self.state, to = %next, index = session.index, "State transition");
        }
        self.state = next;
        self.session = Some(session);
        next
    }

    /// Stop the run. Idempotent: only the first call after a non-stopped state has
    /// any effect, and it emits exactly one `RunStopped`.
    pub async fn stop(&mut self) {
        if self.state == ScopeState::Stopped {
            debug!("Stop requested while already stopped");
            return;
        }
        let was_active = self.session.as_ref().is_some_and(|s| !s.finished);
        self.state = ScopeState::Stopped;

        let summary = match self.session.as_mut() {
            Some(session) => {
                session.finished = true;
                if let Some(job) = &session.focus_job {
                    job.cancel();
                }
                session.summary
            }
            None => RunSummary::default(),
        };
        let limit = self
            .session
            .as_ref()
            .map_or(DEFAULT_HARDWARE_TIMEOUT, |s| s.config.hardware_timeout());
        info!(?summary, "Acquisition run stopped");
        emit(&self.events, AcquisitionEvent::RunStopped(summary));

        if was_active {
            self.stop_stage(limit).await;
        }
    }

    /// Tick on `interval` until the run has finished, then return the final status.
    pub async fn run_until_done(&mut self, interval: Duration) -> RunStatus {
        while self.session.is_some() && !self.status().finished {
            self.tick().await;
            if self.status().finished {
                break;
            }
            sleep(interval).await;
        }
        self.status()
    }

    /// Stop any active run and wait for the focus rig to come back.
    pub async fn shutdown(&mut self) {
        if self.session.as_ref().is_some_and(|s| !s.finished) {
            self.stop().await;
        }
        let job = self.session.as_mut().and_then(|s| s.focus_job.take());
        if let Some(job) = job {
            job.cancel();
            match job.join().await {
                Ok(outcome) => self.rig = Some(outcome.rig),
                Err(e) => error!(error = %e, "Focus rig lost during shutdown"),
            }
        }
    }

    /// Take the rig back from a finished focus job, if there is one.
    async fn reclaim_rig(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session
            .focus_job
            .as_ref()
            .is_some_and(AutofocusJob::is_finished)
        {
            return;
        }
        if let Some(job) = session.focus_job.take() {
            match job.join().await {
                Ok(outcome) => {
                    debug!(discarded = outcome.results.len(), "Focus rig reclaimed");
                    self.rig = Some(outcome.rig);
                }
                Err(e) => error!(error = %e, "Focus rig lost"),
            }
        }
    }

    async fn read_frame(&self, limit: Duration) -> Result<Frame, String> {
        let Some(rig) = self.rig.as_ref() else {
            return Err("focus rig is held by an autofocus job".into());
        };
        let frame = with_timeout(limit, "frame read", rig.frames.current_frame())
            .await
            .map_err(|e| format!("{e:#}"))?;
        frame.check().map_err(|e| e.to_string())?;
        Ok(frame)
    }

    async fn stop_stage(&self, limit: Duration) {
        if let Some(stage) = self.stage.as_deref() {
            if let Err(e) = with_timeout(limit, "stage stop", stage.stop()).await {
                warn!(error = %e, "Stage stop failed");
            }
        }
    }

    // =========================================================================
    // Per-state steps
    // =========================================================================

    async fn begin_point(&mut self, s: &mut Session) -> ScopeState {
        let (Some(point), Some(stage)) = (s.point(), self.stage.as_deref()) else {
            s.fault = Some(SkipReason::StageFault("no target for this point".into()));
            return ScopeState::Error;
        };
        emit(
            &self.events,
            AcquisitionEvent::PointStarted {
                index: point.index,
                x_um: point.x_um,
                y_um: point.y_um,
            },
        );
        let limit = s.config.hardware_timeout();
        match with_timeout(limit, "stage move", stage.move_to(point.x_um, point.y_um)).await {
            Ok(()) => {
                s.deadline =
                    Some(Instant::now() + Duration::from_millis(s.config.arrival_timeout_ms));
                ScopeState::WaitingArrival
            }
            Err(e) => {
                warn!(index = s.index, error = %e, "Stage rejected move");
                s.fault = Some(SkipReason::StageFault(format!("{e:#}")));
                ScopeState::Error
            }
        }
    }

    async fn poll_arrival(&mut self, s: &mut Session) -> ScopeState {
        let Some(stage) = self.stage.as_deref() else {
            s.fault = Some(SkipReason::StageFault("stage detached".into()));
            return ScopeState::Error;
        };
        let limit = s.config.hardware_timeout();
        match with_timeout(limit, "arrival poll", stage.is_at_target()).await {
            Ok(true) => {
                s.deadline = Some(Instant::now() + Duration::from_millis(s.config.settle_time_ms));
                ScopeState::Settling
            }
            Ok(false) if s.deadline.is_some_and(|d| Instant::now() >= d) => {
                warn!(
                    index = s.index,
                    timeout_ms = s.config.arrival_timeout_ms,
                    "Stage did not arrive in time"
                );
                s.fault = Some(SkipReason::ArrivalTimeout);
                ScopeState::Error
            }
            Ok(false) => ScopeState::WaitingArrival,
            Err(e) => {
                warn!(index = s.index, error = %e, "Arrival poll failed");
                s.fault = Some(SkipReason::StageFault(format!("{e:#}")));
                ScopeState::Error
            }
        }
    }

    async fn settle(&mut self, s: &mut Session) -> ScopeState {
        if s.deadline.is_some_and(|d| Instant::now() < d) {
            return ScopeState::Settling;
        }
        s.deadline = None;
        if s.config.autofocus_enabled {
            return ScopeState::Detecting;
        }
        match self.read_frame(s.config.hardware_timeout()).await {
            Ok(frame) => {
                s.pending = Some(PendingCapture::Plain(frame));
                ScopeState::Capturing
            }
            Err(reason) => {
                s.fault = Some(SkipReason::FrameUnavailable(reason));
                ScopeState::Error
            }
        }
    }

    async fn detect(&mut self, s: &mut Session) -> ScopeState {
        let limit = s.config.hardware_timeout();
        let frame = match self.read_frame(limit).await {
            Ok(frame) => frame,
            Err(reason) => {
                s.fault = Some(SkipReason::FrameUnavailable(reason));
                return ScopeState::Error;
            }
        };
        let Some(adapter) = s.detection.as_ref() else {
            s.tally.skip = Some(SkipReason::DetectionFailed("no detector".into()));
            return ScopeState::Advancing;
        };

        let Ok(outcome) = tokio::time::timeout(limit, adapter.detect(&frame)).await else {
            warn!(index = s.index, timeout = ?limit, "Detector timed out");
            s.tally.skip = Some(SkipReason::DetectionFailed(format!(
                "detector timed out after {limit:?}"
            )));
            return ScopeState::Advancing;
        };
        if let Some(err) = outcome.error {
            s.tally.skip = Some(SkipReason::DetectionFailed(err.to_string()));
            return ScopeState::Advancing;
        }
        let objects: Vec<DetectedObject> = match s.config.object_policy {
            ObjectPolicy::All => outcome.objects,
            ObjectPolicy::Primary => primary(&outcome.objects).cloned().into_iter().collect(),
        };
        if objects.is_empty() {
            debug!(index = s.index, "No objects detected");
            s.tally.skip = Some(SkipReason::NoObjects);
            return ScopeState::Advancing;
        }

        s.tally.object_count = objects.len();
        s.objects = objects;
        ScopeState::Focusing
    }

    async fn poll_focus(&mut self, s: &mut Session) -> ScopeState {
        if s.focus_job.is_none() {
            let Some(rig) = self.rig.take() else {
                s.tally.skip = Some(SkipReason::AutofocusUnavailable(
                    "focus rig unavailable".into(),
                ));
                return ScopeState::Advancing;
            };
            let objects = std::mem::take(&mut s.objects);
            return match s.engine.start(rig, objects) {
                Ok(job) => {
                    s.focus_job = Some(job);
                    ScopeState::Focusing
                }
                Err(rejected) => {
                    self.rig = Some(rejected.rig);
                    warn!(index = s.index, error = %rejected.error, "Autofocus refused to start");
                    s.tally.skip = Some(SkipReason::AutofocusUnavailable(
                        rejected.error.to_string(),
                    ));
                    ScopeState::Advancing
                }
            };
        }

        if !s.focus_job.as_ref().is_some_and(AutofocusJob::is_finished) {
            return ScopeState::Focusing;
        }
        let Some(job) = s.focus_job.take() else {
            return ScopeState::Focusing;
        };
        match job.join().await {
            Ok(outcome) => {
                self.rig = Some(outcome.rig);
                s.summary.objects_focused += outcome.results.len();
                s.summary.autofocus_failures += outcome.failures.len();
                s.pending = Some(PendingCapture::Focused(outcome.results));
                ScopeState::Capturing
            }
            Err(e) => {
                error!(index = s.index, error = %e, "Autofocus worker lost");
                s.tally.skip = Some(SkipReason::AutofocusUnavailable(e.to_string()));
                ScopeState::Advancing
            }
        }
    }

    async fn capture(&mut self, s: &mut Session) -> ScopeState {
        let Some(sink) = self.sink.clone() else {
            s.tally.skip = Some(SkipReason::StageFault("capture sink detached".into()));
            return ScopeState::Advancing;
        };
        match s.pending.take() {
            Some(PendingCapture::Plain(frame)) => {
                let metadata = s.metadata(CaptureKind::Plain, None, None, None, false);
                save_capture(sink.as_ref(), &frame, &metadata, s).await;
            }
            Some(PendingCapture::Focused(results)) => {
                let autofocus = s.config.autofocus.clone();
                for result in results {
                    if result.low_confidence && autofocus.discard_low_confidence {
                        info!(
                            index = s.index,
                            object = result.object_index,
                            score = result.score,
                            min = autofocus.min_focus_score,
                            "Discarding low-confidence focus result"
                        );
                        s.summary.low_confidence_discarded += 1;
                        continue;
                    }
                    let metadata = s.metadata(
                        CaptureKind::Focused,
                        Some(result.object_index),
                        Some(result.z_optimal),
                        Some(result.score),
                        result.low_confidence,
                    );
                    save_capture(sink.as_ref(), &result.frame, &metadata, s).await;

                    if let (true, Some(secondary)) = (autofocus.save_secondary, &result.secondary) {
                        let metadata = s.metadata(
                            CaptureKind::Secondary,
                            Some(result.object_index),
                            Some(secondary.z),
                            None,
                            result.low_confidence,
                        );
                        save_capture(sink.as_ref(), &secondary.frame, &metadata, s).await;
                    }
                }
            }
            None => {}
        }
        ScopeState::Advancing
    }

    fn advance(&mut self, s: &mut Session) -> ScopeState {
        let tally = std::mem::take(&mut s.tally);
        let index = s.index;
        s.summary.points_processed += 1;
        match tally.skip {
            Some(reason) => {
                s.summary.points_skipped += 1;
                info!(index, %reason, "Point skipped");
                emit(&self.events, AcquisitionEvent::PointSkipped { index, reason });
            }
            None => {
                info!(
                    index,
                    objects = tally.object_count,
                    captured = tally.captured,
                    "Point completed"
                );
                emit(
                    &self.events,
                    AcquisitionEvent::PointCompleted {
                        index,
                        object_count: tally.object_count,
                        captured_count: tally.captured,
                    },
                );
            }
        }

        s.objects.clear();
        s.pending = None;
        s.deadline = None;
        s.index += 1;
        if s.index < s.trajectory.len() {
            return ScopeState::MovingToPoint;
        }

        s.finished = true;
        info!(summary = ?s.summary, "Acquisition run completed");
        emit(&self.events, AcquisitionEvent::RunCompleted(s.summary));
        ScopeState::Completed
    }

    async fn handle_fault(&mut self, s: &mut Session) -> ScopeState {
        let reason = s
            .fault
            .take()
            .unwrap_or_else(|| SkipReason::StageFault("unspecified fault".into()));
        let abort = reason == SkipReason::ArrivalTimeout
            && matches!(s.config.arrival_policy, ArrivalPolicy::Abort);
        if !abort {
            s.tally.skip = Some(reason);
            return ScopeState::Advancing;
        }

        error!(index = s.index, %reason, "Aborting run");
        s.finished = true;
        self.stop_stage(s.config.hardware_timeout()).await;
        emit(
            &self.events,
            AcquisitionEvent::RunError {
                index: s.index,
                reason,
                summary: s.summary,
            },
        );
        ScopeState::Error
    }
}

async fn save_capture(
    sink: &dyn CaptureSink,
    frame: &Frame,
    metadata: &CaptureMetadata,
    s: &mut Session,
) {
    let limit = s.config.hardware_timeout();
    match with_timeout(limit, "capture save", sink.save(frame, metadata)).await {
        Ok(path) => {
            debug!(
                index = metadata.point_index,
                object = ?metadata.object_index,
                kind = ?metadata.kind,
                path = %path.display(),
                "Frame saved"
            );
            s.tally.captured += 1;
            s.summary.images_captured += 1;
        }
        Err(e) => {
            warn!(index = metadata.point_index, error = %e, "Capture sink rejected frame");
            s.summary.capture_failures += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MemorySink, MockDetector, MockOptics, MockStage};

    fn hardware() -> ScopeHardware {
        let optics = MockOptics::new(16, 16, (0.0, 20.0));
        ScopeHardware::new()
            .with_stage(MockStage::new())
            .with_focus(optics.actuator())
            .with_frames(optics.camera())
            .with_detector(Arc::new(MockDetector::default()))
            .with_sink(Arc::new(MemorySink::new()))
    }

    fn trajectory() -> Trajectory {
        Trajectory::from_xy(&[(0.0, 0.0), (10.0, 0.0)]).unwrap()
    }

    #[tokio::test]
    async fn missing_collaborators_are_fatal_at_start() {
        let mut orch = MicroscopyOrchestrator::new(ScopeHardware::new());
        let err = orch.start(trajectory(), RunConfig::default()).await.unwrap_err();
        assert!(matches!(err, ScopeError::MissingCollaborator("stage")));
        assert_eq!(orch.state(), ScopeState::Idle);

        let optics = MockOptics::new(4, 4, (0.0, 1.0));
        let no_focus = ScopeHardware::new()
            .with_stage(MockStage::new())
            .with_frames(optics.camera())
            .with_detector(Arc::new(MockDetector::default()))
            .with_sink(Arc::new(MemorySink::new()));
        let mut orch = MicroscopyOrchestrator::new(no_focus);
        let err = orch.start(trajectory(), RunConfig::default()).await.unwrap_err();
        assert!(matches!(err, ScopeError::MissingCollaborator("focus actuator")));

        let plain = RunConfig {
            autofocus_enabled: false,
            ..RunConfig::default()
        };
        assert!(orch.start(trajectory(), plain).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut orch = MicroscopyOrchestrator::new(hardware());
        let mut config = RunConfig::default();
        config.autofocus.z_coarse_step = 0.0;
        assert!(matches!(
            orch.start(trajectory(), config).await,
            Err(ScopeError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn second_start_while_running_is_rejected() {
        let mut orch = MicroscopyOrchestrator::new(hardware());
        orch.start(trajectory(), RunConfig::default()).await.unwrap();
        assert!(matches!(
            orch.start(trajectory(), RunConfig::default()).await,
            Err(ScopeError::RunInProgress)
        ));
        let status = orch.status();
        assert_eq!(status.state, ScopeState::MovingToPoint);
        assert_eq!((status.index, status.total), (0, 2));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut orch = MicroscopyOrchestrator::new(hardware());
        let mut events = orch.subscribe();
        orch.start(trajectory(), RunConfig::default()).await.unwrap();
        orch.tick().await;

        orch.stop().await;
        orch.stop().await;
        orch.stop().await;
        assert_eq!(orch.state(), ScopeState::Stopped);
        assert_eq!(orch.tick().await, ScopeState::Stopped);

        let mut stopped = 0;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, AcquisitionEvent::RunStopped(_)) {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 1);
        assert!(orch.status().finished);
    }
}
