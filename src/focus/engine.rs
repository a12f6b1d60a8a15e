//! Per-object autofocus on a background worker.
//!
//! One job focuses a list of detected objects strictly in index order:
//!
//! ```text
//! Idle -> Scanning(i) -> Refining(i) -> Capturing(i) -> [Scanning(i+1) | Complete]
//!              \______________\______________\_________> Cancelled
//! ```
//!
//! For each object the engine runs [`search`] over the actuator's full travel, with
//! every sample being move -> settle -> read frame -> masked sharpness of the object's
//! region. It then moves to the winning position and captures the result frame
//! before the axis moves again. An optional secondary frame is taken at a fixed
//! offset, after which the axis is returned to best focus.
//!
//! The [`FocusRig`] is moved into the worker and handed back in [`AutofocusOutcome`].
//! Cancellation is cooperative: it is observed before each hardware cycle, so an
//! in-flight move/settle/capture always completes and nothing touches the hardware
//! afterwards.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AutofocusConfig;
use crate::core::{DetectedObject, Frame, Region};
use crate::error_recovery::{retry_async, with_timeout};
use crate::events::{emit, AcquisitionEvent, EventSender};
use crate::focus::metric::{RegionView, SharpnessMetric};
use crate::focus::search::{search, FocusProbe, SearchError, SearchParams, SearchPhase};
use crate::hardware::capabilities::{FocusActuator, FocusRig, FrameSource};

/// Engine run state, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Worker created, nothing done yet
    Idle,
    /// Coarse sweep of object `i`
    Scanning(usize),
    /// Fine sweep of object `i`
    Refining(usize),
    /// Moving to best focus of object `i` and capturing
    Capturing(usize),
    /// Every object was attempted
    Complete,
    /// Stopped early by [`AutofocusJob::cancel`]
    Cancelled,
}

impl EngineState {
    /// `Complete` or `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Complete | EngineState::Cancelled)
    }
}

/// Frame captured at an offset from best focus.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondaryCapture {
    /// Axial position of the secondary frame
    pub z: f64,
    /// The frame
    pub frame: Arc<Frame>,
}

/// Focus result for one object. Immutable once sent.
#[derive(Debug, Clone, PartialEq)]
pub struct AutofocusResult {
    /// Index of the object in the job's list
    pub object_index: usize,
    /// Best-focus axial position (the position the frame was captured at)
    pub z_optimal: f64,
    /// Position reported by the actuator right after the final move, if readable
    pub z_readback: Option<f64>,
    /// Sharpness of `frame` over the object's region
    pub score: f64,
    /// Frame captured while at `z_optimal`, before any further movement
    pub frame: Arc<Frame>,
    /// Optional offset frame
    pub secondary: Option<SecondaryCapture>,
    /// Object bounding region
    pub region: Region,
    /// `score` is below `min_focus_score`
    pub low_confidence: bool,
    /// Every coarse sample scored the same
    pub flat_response: bool,
    /// Samples taken by the search
    pub samples_taken: usize,
}

/// An object the engine gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFailure {
    /// Object index
    pub object_index: usize,
    /// Why
    pub reason: String,
}

/// Reasons a job refuses to start.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AutofocusError {
    /// The rig has no focus actuator
    #[error("no focus actuator attached")]
    MissingActuator,
    /// Nothing to focus
    #[error("object list is empty")]
    NoObjects,
    /// Scan settings are unusable
    #[error("invalid autofocus configuration: {0}")]
    InvalidConfig(String),
    /// The worker task died without returning the rig
    #[error("autofocus worker terminated abnormally: {0}")]
    WorkerLost(String),
}

/// A rejected start. The rig is handed straight back.
pub struct StartRejected {
    /// Why the job did not start
    pub error: AutofocusError,
    /// The untouched rig
    pub rig: FocusRig,
}

impl fmt::Debug for StartRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartRejected")
            .field("error", &self.error)
            .finish()
    }
}

/// Everything a finished job hands back.
#[derive(Debug)]
pub struct AutofocusOutcome {
    /// The rig, returned to the caller
    pub rig: FocusRig,
    /// Results in object index order
    pub results: Vec<AutofocusResult>,
    /// Objects that were given up on
    pub failures: Vec<ObjectFailure>,
    /// `Complete` or `Cancelled`
    pub final_state: EngineState,
}

/// Handle to a running job.
pub struct AutofocusJob {
    cancel_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<EngineState>,
    results_rx: mpsc::UnboundedReceiver<AutofocusResult>,
    handle: JoinHandle<AutofocusOutcome>,
}

impl AutofocusJob {
    /// Request cooperative cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Whether cancellation was requested.
    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes.
    pub fn state_watch(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Next per-object result as soon as it is available, in index order.
    /// `None` once the worker has finished and all results were taken.
    pub async fn next_result(&mut self) -> Option<AutofocusResult> {
        self.results_rx.recv().await
    }

    /// Whether the worker has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker and take back the rig.
    pub async fn join(self) -> Result<AutofocusOutcome, AutofocusError> {
        self.handle
            .await
            .map_err(|e| AutofocusError::WorkerLost(e.to_string()))
    }
}

impl fmt::Debug for AutofocusJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutofocusJob")
            .field("state", &self.state())
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}

/// Autofocus engine. Cheap to clone; each `start` spawns one worker.
#[derive(Debug, Clone)]
pub struct AutofocusEngine {
    config: AutofocusConfig,
    metric: SharpnessMetric,
    events: Option<EventSender>,
}

impl AutofocusEngine {
    /// Engine with the given scan settings.
    pub fn new(config: AutofocusConfig) -> Self {
        let metric = SharpnessMetric::new(config.weights);
        Self {
            config,
            metric,
            events: None,
        }
    }

    /// Publish progress and failure events on `events`.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Scan settings in use.
    pub fn config(&self) -> &AutofocusConfig {
        &self.config
    }

    /// Take ownership of `rig` and focus `objects` on a background task.
    ///
    /// Fails fast, returning the rig, if the actuator is absent, the list is empty or
    /// the configuration is invalid.
    pub fn start(
        &self,
        rig: FocusRig,
        objects: Vec<DetectedObject>,
    ) -> Result<AutofocusJob, StartRejected> {
        let rejected = |error, rig| Err(StartRejected { error, rig });
        if rig.actuator.is_none() {
            return rejected(AutofocusError::MissingActuator, rig);
        }
        if objects.is_empty() {
            return rejected(AutofocusError::NoObjects, rig);
        }
        if let Err(e) = self.config.validate() {
            return rejected(AutofocusError::InvalidConfig(e.to_string()), rig);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            rig,
            objects,
            config: self.config.clone(),
            metric: self.metric,
            events: self.events.clone(),
            cancel_rx,
            state_tx,
            results_tx,
        };
        let handle = tokio::spawn(worker.run());

        Ok(AutofocusJob {
            cancel_tx,
            state_rx,
            results_rx,
            handle,
        })
    }
}

/// Sharpness of `object`'s region in `frame`, honouring its mask.
/// A frame whose buffer is shorter than its dimensions scores 0.
pub fn score_object(metric: &SharpnessMetric, frame: &Frame, object: &DetectedObject) -> f64 {
    let Some((clipped, pixels)) = frame.crop(&object.region) else {
        return 0.0;
    };
    let mask = object
        .mask
        .as_ref()
        .filter(|m| m.width == clipped.width && m.height == clipped.height);
    metric.score(
        RegionView::new(clipped.width as usize, clipped.height as usize, &pixels),
        mask,
    )
}

// =============================================================================
// Worker
// =============================================================================

enum ObjectAbort {
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
enum ProbeError {
    Cancelled,
    Hardware(String),
}

struct Worker {
    rig: FocusRig,
    objects: Vec<DetectedObject>,
    config: AutofocusConfig,
    metric: SharpnessMetric,
    events: Option<EventSender>,
    cancel_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<EngineState>,
    results_tx: mpsc::UnboundedSender<AutofocusResult>,
}

impl Worker {
    async fn run(mut self) -> AutofocusOutcome {
        let objects = std::mem::take(&mut self.objects);
        let mut results = Vec::with_capacity(objects.len());
        let mut failures = Vec::new();
        let mut final_state = EngineState::Complete;

        info!(objects = objects.len(), "Autofocus job started");
        for object in &objects {
            if self.cancelled() {
                final_state = EngineState::Cancelled;
                break;
            }
            self.state_tx.send_replace(EngineState::Scanning(object.index));

            match self.focus_object(object).await {
                Ok(result) => {
                    info!(
                        object = result.object_index,
                        z = result.z_optimal,
                        score = result.score,
                        low_confidence = result.low_confidence,
                        "Object focused"
                    );
                    // Receiver may be gone (job detached); results are still returned
                    let _ = self.results_tx.send(result.clone());
                    results.push(result);
                }
                Err(ObjectAbort::Cancelled) => {
                    final_state = EngineState::Cancelled;
                    break;
                }
                Err(ObjectAbort::Failed(reason)) => {
                    warn!(object = object.index, %reason, "Autofocus failed for object, continuing");
                    if let Some(events) = &self.events {
                        emit(
                            events,
                            AcquisitionEvent::AutofocusFailed {
                                object_index: object.index,
                                reason: reason.clone(),
                            },
                        );
                    }
                    failures.push(ObjectFailure {
                        object_index: object.index,
                        reason,
                    });
                }
            }
        }

        self.state_tx.send_replace(final_state);
        info!(
            focused = results.len(),
            failed = failures.len(),
            state = ?final_state,
            "Autofocus job finished"
        );
        AutofocusOutcome {
            rig: self.rig,
            results,
            failures,
            final_state,
        }
    }

    fn cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    async fn focus_object(&self, object: &DetectedObject) -> Result<AutofocusResult, ObjectAbort> {
        let Some(actuator) = self.rig.actuator.as_deref() else {
            return Err(ObjectAbort::Failed("no focus actuator".into()));
        };
        let frames: &dyn FrameSource = &*self.rig.frames;
        let retry = &self.config.retry;
        let settle = Duration::from_millis(self.config.focus_settle_ms);
        let limit = self.config.hardware_timeout();

        let (axis_min, axis_max) = retry_async(retry, "travel_range", || {
            with_timeout(limit, "travel_range", actuator.travel_range())
        })
        .await
            .map_err(|e| ObjectAbort::Failed(format!("{e:#}")))?;

        let params = SearchParams {
            axis_min,
            axis_max,
            coarse_step: self.config.z_coarse_step,
            fine_step: self.config.z_fine_step,
            fine_radius: self.config.z_fine_radius,
            max_samples: self.config.max_samples_per_object,
        };

        let mut probe = ScanProbe {
            worker: self,
            actuator,
            frames,
            object,
            settle,
        };
        let outcome = match search(&mut probe, &params).await {
            Ok(outcome) => outcome,
            Err(SearchError::Probe(ProbeError::Cancelled)) => return Err(ObjectAbort::Cancelled),
            Err(SearchError::Probe(ProbeError::Hardware(msg))) => {
                return Err(ObjectAbort::Failed(msg))
            }
            Err(other) => return Err(ObjectAbort::Failed(other.to_string())),
        };
        debug!(
            object = object.index,
            coarse_peak = outcome.coarse_peak,
            best = outcome.best_position,
            samples = outcome.samples.len(),
            "Focus search finished"
        );

        if self.cancelled() {
            return Err(ObjectAbort::Cancelled);
        }
        self.state_tx.send_replace(EngineState::Capturing(object.index));

        let z_optimal = outcome.best_position;
        let frame = self
            .move_settle_capture(actuator, frames, z_optimal, settle)
            .await
            .map_err(ObjectAbort::Failed)?;
        let frame = Arc::new(frame);

        let readback = with_timeout(limit, "read_position", actuator.read_position()).await;
        let z_readback = match readback {
            Ok(z) => {
                if (z - z_optimal).abs() > self.config.z_fine_step {
                    warn!(
                        object = object.index,
                        commanded = z_optimal,
                        reported = z,
                        "Actuator readback disagrees with commanded position"
                    );
                }
                Some(z)
            }
            Err(e) => {
                warn!(object = object.index, error = %e, "Could not read back focus position");
                None
            }
        };

        let score = score_object(&self.metric, &frame, object);
        let secondary = match self.config.secondary_offset {
            Some(offset) if !self.cancelled() => {
                let z = (z_optimal + offset).clamp(axis_min, axis_max);
                self.capture_secondary(actuator, frames, object.index, z, z_optimal, settle)
                    .await
            }
            _ => None,
        };

        Ok(AutofocusResult {
            object_index: object.index,
            z_optimal,
            z_readback,
            score,
            frame,
            secondary,
            region: object.region,
            low_confidence: score < self.config.min_focus_score,
            flat_response: outcome.flat,
            samples_taken: outcome.samples.len(),
        })
    }

    async fn move_settle_capture(
        &self,
        actuator: &dyn FocusActuator,
        frames: &dyn FrameSource,
        z: f64,
        settle: Duration,
    ) -> Result<Frame, String> {
        let limit = self.config.hardware_timeout();
        retry_async(&self.config.retry, "focus move", || {
            with_timeout(limit, "focus move", actuator.move_to(z))
        })
        .await
        .map_err(|e| format!("{e:#}"))?;
        tokio::time::sleep(settle).await;
        let frame = with_timeout(limit, "frame read", frames.current_frame())
            .await
            .map_err(|e| format!("frame read at z={z}: {e:#}"))?;
        frame
            .check()
            .map_err(|e| format!("frame read at z={z}: {e}"))?;
        Ok(frame)
    }

    async fn capture_secondary(
        &self,
        actuator: &dyn FocusActuator,
        frames: &dyn FrameSource,
        object_index: usize,
        z: f64,
        z_optimal: f64,
        settle: Duration,
    ) -> Option<SecondaryCapture> {
        let captured = match self.move_settle_capture(actuator, frames, z, settle).await {
            Ok(frame) => Some(SecondaryCapture {
                z,
                frame: Arc::new(frame),
            }),
            Err(reason) => {
                warn!(object = object_index, %reason, "Secondary capture failed");
                None
            }
        };

        // Leave the axis at best focus for whatever happens next at this point
        let limit = self.config.hardware_timeout();
        let returned = retry_async(&self.config.retry, "return to focus", || {
            with_timeout(limit, "return to focus", actuator.move_to(z_optimal))
        })
        .await;
        match returned {
            Ok(()) => tokio::time::sleep(settle).await,
            Err(e) => warn!(object = object_index, error = %e, "Could not return to best focus"),
        }
        captured
    }
}

struct ScanProbe<'a> {
    worker: &'a Worker,
    actuator: &'a dyn FocusActuator,
    frames: &'a dyn FrameSource,
    object: &'a DetectedObject,
    settle: Duration,
}

#[async_trait]
impl FocusProbe for ScanProbe<'_> {
    type Error = ProbeError;

    async fn score_at(&mut self, position: f64) -> Result<f64, ProbeError> {
        if self.worker.cancelled() {
            debug!(object = self.object.index, "Cancellation observed");
            return Err(ProbeError::Cancelled);
        }
        let frame = self
            .worker
            .move_settle_capture(self.actuator, self.frames, position, self.settle)
            .await
            .map_err(ProbeError::Hardware)?;
        let score = score_object(&self.worker.metric, &frame, self.object);

        tracing::trace!(object = self.object.index, z = position, score, "Focus sample");
        if let Some(events) = &self.worker.events {
            emit(
                events,
                AcquisitionEvent::AutofocusProgress {
                    object_index: self.object.index,
                    position,
                    score,
                },
            );
        }
        Ok(score)
    }

    fn on_phase(&mut self, phase: SearchPhase) {
        let state = match phase {
            SearchPhase::Coarse => EngineState::Scanning(self.object.index),
            SearchPhase::Fine => EngineState::Refining(self.object.index),
        };
        self.worker.state_tx.send_replace(state);
    }
}
