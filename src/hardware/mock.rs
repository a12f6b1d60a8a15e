//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep),
//! so tests can run them under paused time.
//!
//! # Available Mocks
//!
//! - `MockStage` - XY stage with timed travel and polled arrival
//! - `MockOptics` - Shared simulated optical axis
//! - `MockFocusActuator` / `MockFrameSource` - Focus drive and camera over one `MockOptics`
//! - `MockDetector` - Scripted or failing object detector
//! - `MemorySink` - Capture sink that keeps frames in memory
//!
//! Every mock is `Clone`; clones share state, so a test can keep one handle while
//! another is boxed into [`crate::hardware::ScopeHardware`].
//!
//! # Optical Model
//!
//! Each specimen occupies a frame region and has its own focal plane. Inside the region
//! the camera sees a 2x2-block checkerboard whose amplitude is
//! `80 / (1 + ((z - focal_z) / depth_of_field)^2)` on a base level of 100, so every
//! specimen's masked sharpness is unimodal in `z` and peaks at its focal plane.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::trace;

use crate::core::{Frame, PixelBuffer, Region};
use crate::detection::RawDetection;
use crate::hardware::capabilities::{
    CaptureMetadata, CaptureSink, FocusActuator, FrameSource, ObjectDetector, Stage,
};

// =============================================================================
// MockStage - Simulated XY Stage
// =============================================================================

#[derive(Debug)]
struct StageState {
    position: (f64, f64),
    target: (f64, f64),
    arrival_at: Instant,
    moves: Vec<(f64, f64)>,
    stops: usize,
}

/// Mock XY stage with realistic timing
///
/// `move_to` returns as soon as the command is accepted; `is_at_target` reports
/// arrival once the travel time at the configured speed has elapsed.
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockStage::new();
/// stage.move_to(1000.0, 0.0).await?;
/// while !stage.is_at_target().await? {
///     tokio::time::sleep(Duration::from_millis(10)).await;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MockStage {
    state: Arc<RwLock<StageState>>,
    speed_um_per_sec: f64,
    never_arrives: bool,
    faulty: bool,
    stalled: bool,
}

impl MockStage {
    /// Stage at the origin travelling at 10 mm/s
    pub fn new() -> Self {
        Self::with_speed(10_000.0)
    }

    /// Stage with custom speed
    ///
    /// # Arguments
    /// * `speed_um_per_sec` - Travel speed in micrometers per second
    pub fn with_speed(speed_um_per_sec: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(StageState {
                position: (0.0, 0.0),
                target: (0.0, 0.0),
                arrival_at: Instant::now(),
                moves: Vec::new(),
                stops: 0,
            })),
            speed_um_per_sec,
            never_arrives: false,
            faulty: false,
            stalled: false,
        }
    }

    /// Stage that accepts moves but never reports arrival
    pub fn never_arrives() -> Self {
        Self {
            never_arrives: true,
            ..Self::new()
        }
    }

    /// Stage that rejects every move command
    pub fn faulty() -> Self {
        Self {
            faulty: true,
            ..Self::new()
        }
    }

    /// Stage whose move command never completes (hung link)
    pub fn stalled() -> Self {
        Self {
            stalled: true,
            ..Self::new()
        }
    }

    /// Commanded targets, in order
    pub async fn moves(&self) -> Vec<(f64, f64)> {
        self.state.read().await.moves.clone()
    }

    /// Number of `stop()` calls
    pub async fn stop_count(&self) -> usize {
        self.state.read().await.stops
    }

    /// Last known position
    pub async fn position(&self) -> (f64, f64) {
        self.state.read().await.position
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for MockStage {
    async fn move_to(&self, x_um: f64, y_um: f64) -> Result<()> {
        if self.faulty {
            bail!("MockStage: axis fault");
        }
        if self.stalled {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.write().await;
        let (cx, cy) = state.position;
        let distance = ((x_um - cx).powi(2) + (y_um - cy).powi(2)).sqrt();
        let travel = Duration::from_secs_f64(distance / self.speed_um_per_sec);
        trace!(x_um, y_um, ?travel, "MockStage: move commanded");

        state.target = (x_um, y_um);
        state.arrival_at = Instant::now() + travel;
        state.moves.push((x_um, y_um));
        Ok(())
    }

    async fn is_at_target(&self) -> Result<bool> {
        if self.never_arrives {
            return Ok(false);
        }
        let mut state = self.state.write().await;
        if Instant::now() >= state.arrival_at {
            state.position = state.target;
            return Ok(true);
        }
        Ok(false)
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.stops += 1;
        state.target = state.position;
        state.arrival_at = Instant::now();
        Ok(())
    }
}

// =============================================================================
// MockOptics - Shared Optical Axis
// =============================================================================

/// A feature in the field of view with its own focal plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Specimen {
    /// Where it appears in the frame
    pub region: Region,
    /// Axial position of best focus
    pub focal_z: f64,
}

#[derive(Debug)]
struct OpticsState {
    z: f64,
    travel: (f64, f64),
    depth_of_field: f64,
    specimens: Vec<Specimen>,
    move_log: Vec<f64>,
    move_calls: usize,
    failing_moves: Option<Range<usize>>,
    stalled_moves: Option<Range<usize>>,
    frame_log: Vec<(u64, f64)>,
    next_sequence: u64,
}

/// Simulated optical axis shared by [`MockFocusActuator`] and [`MockFrameSource`].
#[derive(Debug, Clone)]
pub struct MockOptics {
    state: Arc<RwLock<OpticsState>>,
    width: u32,
    height: u32,
}

impl MockOptics {
    /// `width x height` field of view, axis travel `travel`, focus starting at `travel.0`
    pub fn new(width: u32, height: u32, travel: (f64, f64)) -> Self {
        Self {
            state: Arc::new(RwLock::new(OpticsState {
                z: travel.0,
                travel,
                depth_of_field: 4.0,
                specimens: Vec::new(),
                move_log: Vec::new(),
                move_calls: 0,
                failing_moves: None,
                stalled_moves: None,
                frame_log: Vec::new(),
                next_sequence: 0,
            })),
            width,
            height,
        }
    }

    /// Add a specimen
    pub async fn add_specimen(&self, region: Region, focal_z: f64) {
        self.state
            .write()
            .await
            .specimens
            .push(Specimen { region, focal_z });
    }

    /// Change the depth of field (axial half-width of the contrast peak)
    pub async fn set_depth_of_field(&self, depth: f64) {
        self.state.write().await.depth_of_field = depth;
    }

    /// Make focus moves with call index (0-based, counting every attempt) in `calls` fail
    pub async fn fail_moves(&self, calls: Range<usize>) {
        self.state.write().await.failing_moves = Some(calls);
    }

    /// Make focus moves with call index in `calls` hang without ever completing
    pub async fn stall_moves(&self, calls: Range<usize>) {
        self.state.write().await.stalled_moves = Some(calls);
    }

    /// Focus drive paired with this axis
    pub fn actuator(&self) -> MockFocusActuator {
        MockFocusActuator {
            optics: self.clone(),
            move_latency: Duration::from_millis(10),
        }
    }

    /// Camera paired with this axis
    pub fn camera(&self) -> MockFrameSource {
        MockFrameSource {
            optics: self.clone(),
            readout: Duration::from_millis(5),
        }
    }

    /// Current axial position
    pub async fn z(&self) -> f64 {
        self.state.read().await.z
    }

    /// Successful focus moves, in order
    pub async fn move_log(&self) -> Vec<f64> {
        self.state.read().await.move_log.clone()
    }

    /// `(frame sequence, z at readout)` for every frame handed out
    pub async fn frame_log(&self) -> Vec<(u64, f64)> {
        self.state.read().await.frame_log.clone()
    }

    /// Axial position a frame was read out at
    pub async fn z_of_frame(&self, sequence: u64) -> Option<f64> {
        self.state
            .read()
            .await
            .frame_log
            .iter()
            .find(|(s, _)| *s == sequence)
            .map(|(_, z)| *z)
    }

    /// Focus move attempts plus frame reads so far
    pub async fn hardware_calls(&self) -> usize {
        let state = self.state.read().await;
        state.move_calls + state.frame_log.len()
    }

    /// Specimens as box detections, in insertion order
    pub async fn detections(&self) -> Vec<RawDetection> {
        self.state
            .read()
            .await
            .specimens
            .iter()
            .map(|s| {
                RawDetection::boxed(
                    f64::from(s.region.x),
                    f64::from(s.region.y),
                    f64::from(s.region.width),
                    f64::from(s.region.height),
                    0.9,
                )
            })
            .collect()
    }

    fn render(&self, state: &OpticsState) -> Vec<f64> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![100.0; w * h];
        for specimen in &state.specimens {
            let defocus = (state.z - specimen.focal_z) / state.depth_of_field;
            let amplitude = 80.0 / (1.0 + defocus * defocus);
            let r = specimen.region.clip_to(self.width, self.height);
            for row in r.y..r.y + r.height {
                for col in r.x..r.x + r.width {
                    let sign = if ((col / 2) + (row / 2)) % 2 == 0 { 1.0 } else { -1.0 };
                    pixels[row as usize * w + col as usize] = 100.0 + sign * amplitude;
                }
            }
        }
        pixels
    }
}

/// Focus drive over a [`MockOptics`] axis.
#[derive(Debug, Clone)]
pub struct MockFocusActuator {
    optics: MockOptics,
    move_latency: Duration,
}

impl MockFocusActuator {
    /// Override the per-move latency (default 10 ms)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.move_latency = latency;
        self
    }
}

#[async_trait]
impl FocusActuator for MockFocusActuator {
    async fn move_to(&self, z: f64) -> Result<()> {
        let stalled = {
            let mut state = self.optics.state.write().await;
            let call = state.move_calls;
            state.move_calls += 1;
            if state.failing_moves.as_ref().is_some_and(|r| r.contains(&call)) {
                bail!("MockFocusActuator: communication failure on move #{call}");
            }
            let (lo, hi) = state.travel;
            if !(lo..=hi).contains(&z) {
                bail!("MockFocusActuator: target {z} outside travel [{lo}, {hi}]");
            }
            state.stalled_moves.as_ref().is_some_and(|r| r.contains(&call))
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        sleep(self.move_latency).await;

        let mut state = self.optics.state.write().await;
        state.z = z;
        state.move_log.push(z);
        Ok(())
    }

    async fn read_position(&self) -> Result<f64> {
        Ok(self.optics.state.read().await.z)
    }

    async fn travel_range(&self) -> Result<(f64, f64)> {
        Ok(self.optics.state.read().await.travel)
    }
}

/// Camera over a [`MockOptics`] axis. Frames are `F64` and numbered from 0.
#[derive(Debug, Clone)]
pub struct MockFrameSource {
    optics: MockOptics,
    readout: Duration,
}

#[async_trait]
impl FrameSource for MockFrameSource {
    async fn current_frame(&self) -> Result<Frame> {
        sleep(self.readout).await;
        let mut state = self.optics.state.write().await;
        let pixels = self.optics.render(&state);
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let z = state.z;
        state.frame_log.push((sequence, z));
        Ok(Frame::new(
            sequence,
            self.optics.width,
            self.optics.height,
            PixelBuffer::F64(pixels),
        )?)
    }
}

// =============================================================================
// MockDetector
// =============================================================================

#[derive(Debug)]
enum DetectorScript {
    Queue(VecDeque<Vec<RawDetection>>),
    Repeat(Vec<RawDetection>),
    Fail(String),
}

/// Detector returning canned responses.
#[derive(Debug, Clone)]
pub struct MockDetector {
    script: Arc<Mutex<DetectorScript>>,
    calls: Arc<Mutex<usize>>,
}

impl MockDetector {
    /// One response per call, in order; empty once exhausted
    pub fn scripted(responses: Vec<Vec<RawDetection>>) -> Self {
        Self::from_script(DetectorScript::Queue(responses.into()))
    }

    /// The same response on every call
    pub fn repeating(response: Vec<RawDetection>) -> Self {
        Self::from_script(DetectorScript::Repeat(response))
    }

    /// Every call fails with `message`
    pub fn failing(message: impl Into<String>) -> Self {
        Self::from_script(DetectorScript::Fail(message.into()))
    }

    fn from_script(script: DetectorScript) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Number of `detect` calls
    pub async fn call_count(&self) -> usize {
        *self.calls.lock().await
    }
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::repeating(Vec::new())
    }
}

#[async_trait]
impl ObjectDetector for MockDetector {
    async fn detect(&self, _frame: &Frame) -> Result<Vec<RawDetection>> {
        *self.calls.lock().await += 1;
        match &mut *self.script.lock().await {
            DetectorScript::Queue(queue) => Ok(queue.pop_front().unwrap_or_default()),
            DetectorScript::Repeat(response) => Ok(response.clone()),
            DetectorScript::Fail(message) => bail!("MockDetector: {message}"),
        }
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// A frame handed to [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct SavedCapture {
    /// Path reported back to the caller
    pub path: PathBuf,
    /// The frame
    pub frame: Frame,
    /// Its metadata
    pub metadata: CaptureMetadata,
}

/// Capture sink keeping everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    saved: Arc<RwLock<Vec<SavedCapture>>>,
    failing: bool,
}

impl MemorySink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that rejects every save
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Everything saved so far
    pub async fn saved(&self) -> Vec<SavedCapture> {
        self.saved.read().await.clone()
    }

    /// Number of saved frames
    pub async fn len(&self) -> usize {
        self.saved.read().await.len()
    }

    /// True if nothing was saved
    pub async fn is_empty(&self) -> bool {
        self.saved.read().await.is_empty()
    }
}

#[async_trait]
impl CaptureSink for MemorySink {
    async fn save(&self, frame: &Frame, metadata: &CaptureMetadata) -> Result<PathBuf> {
        if self.failing {
            bail!("MemorySink: disk full");
        }
        let mut saved = self.saved.write().await;
        let object = metadata
            .object_index
            .map_or_else(|| "plain".to_string(), |i| format!("obj{i:02}"));
        let path = PathBuf::from(format!(
            "memory/{}/p{:04}_{}_{}.raw",
            metadata.run_id,
            metadata.point_index,
            object,
            saved.len()
        ));
        saved.push(SavedCapture {
            path: path.clone(),
            frame: frame.clone(),
            metadata: metadata.clone(),
        });
        Ok(path)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
