//! Common test utilities for microscan integration tests
//!
//! This module provides reusable test helpers for:
//! - Building a simulated rig (stage, optics, detector, sink) in one call
//! - Fast run configurations for paused-time tests
//! - Draining broadcast event receivers

#![allow(dead_code)] // Not every test binary uses every helper

use std::sync::Arc;

use rust_microscan::config::RunConfig;
use rust_microscan::core::{DetectedObject, Region};
use rust_microscan::detection::RawDetection;
use rust_microscan::events::AcquisitionEvent;
use rust_microscan::hardware::mock::{MemorySink, MockDetector, MockOptics, MockStage};
use rust_microscan::hardware::ScopeHardware;
use tokio::sync::broadcast;

/// Field of view used by every simulated rig.
pub const FRAME_SIZE: u32 = 64;

/// Focus travel used by every simulated rig.
pub const TRAVEL: (f64, f64) = (0.0, 80.0);

/// Handles kept by the test after the collaborators were boxed into [`ScopeHardware`].
pub struct SimRig {
    pub stage: MockStage,
    pub optics: MockOptics,
    pub detector: MockDetector,
    pub sink: MemorySink,
}

impl SimRig {
    /// Rig with the given stage and detector, empty optics.
    pub fn new(stage: MockStage, detector: MockDetector) -> Self {
        Self {
            stage,
            optics: MockOptics::new(FRAME_SIZE, FRAME_SIZE, TRAVEL),
            detector,
            sink: MemorySink::new(),
        }
    }

    /// Collaborators for an orchestrator; clones share state with `self`.
    pub fn hardware(&self) -> ScopeHardware {
        ScopeHardware::new()
            .with_stage(self.stage.clone())
            .with_focus(self.optics.actuator())
            .with_frames(self.optics.camera())
            .with_detector(Arc::new(self.detector.clone()))
            .with_sink(Arc::new(self.sink.clone()))
    }
}

/// A 16x16 specimen box at `(x, y)`.
pub fn specimen_box(x: u32, y: u32) -> Region {
    Region::new(x, y, 16, 16)
}

/// Raw detection covering `region`.
pub fn raw(region: Region) -> RawDetection {
    RawDetection::boxed(
        f64::from(region.x),
        f64::from(region.y),
        f64::from(region.width),
        f64::from(region.height),
        0.9,
    )
}

/// A normalized object covering `region`, without a mask.
pub fn object(index: usize, region: Region) -> DetectedObject {
    DetectedObject {
        index,
        region,
        area: region.area() as f64,
        confidence: 1.0,
        centroid: region.center(),
        mask: None,
        circularity: 1.0,
        aspect_ratio: 1.0,
    }
}

/// Run configuration with short settle times, tight hardware timeouts and no retry backoff.
pub fn fast_config() -> RunConfig {
    let mut config = RunConfig {
        settle_time_ms: 10,
        arrival_timeout_ms: 500,
        tick_interval_ms: 5,
        hardware_timeout_ms: 200,
        ..RunConfig::default()
    };
    config.autofocus.focus_settle_ms = 5;
    config.autofocus.hardware_timeout_ms = 200;
    config.autofocus.retry.backoff_ms = 1;
    config
}

/// Everything currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<AcquisitionEvent>) -> Vec<AcquisitionEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}
