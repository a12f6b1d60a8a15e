//! Autofocus engine against the simulated optical axis.

mod common;

use std::time::Duration;

use async_trait::async_trait;

use common::{object, specimen_box};
use rust_microscan::config::AutofocusConfig;
use rust_microscan::core::{DetectedObject, Frame, PixelBuffer};
use rust_microscan::error_recovery::RetryPolicy;
use rust_microscan::events::AcquisitionEvent;
use rust_microscan::focus::{AutofocusEngine, AutofocusError, EngineState};
use rust_microscan::hardware::mock::MockOptics;
use rust_microscan::hardware::{FocusRig, FrameSource};
use tokio::sync::broadcast;
use tracing_test::traced_test;

const FOCAL_PLANES: [f64; 3] = [20.0, 42.3, 65.0];

async fn three_specimens() -> (MockOptics, Vec<DetectedObject>) {
    let optics = MockOptics::new(common::FRAME_SIZE, common::FRAME_SIZE, common::TRAVEL);
    let boxes = [specimen_box(4, 4), specimen_box(40, 4), specimen_box(4, 40)];
    let mut objects = Vec::new();
    for (i, (region, focal_z)) in boxes.into_iter().zip(FOCAL_PLANES).enumerate() {
        optics.add_specimen(region, focal_z).await;
        objects.push(object(i, region));
    }
    (optics, objects)
}

fn rig(optics: &MockOptics) -> FocusRig {
    FocusRig::new(Box::new(optics.actuator()), Box::new(optics.camera()))
}

fn config() -> AutofocusConfig {
    AutofocusConfig {
        focus_settle_ms: 5,
        hardware_timeout_ms: 200,
        retry: RetryPolicy::none(),
        ..AutofocusConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn result_frame_was_read_at_z_optimal() {
    let (optics, objects) = three_specimens().await;
    let job = AutofocusEngine::new(config())
        .start(rig(&optics), objects)
        .unwrap();
    let outcome = job.join().await.unwrap();

    assert_eq!(outcome.final_state, EngineState::Complete);
    assert_eq!(outcome.results.len(), 3);
    for (result, focal_z) in outcome.results.iter().zip(FOCAL_PLANES) {
        assert_eq!(
            optics.z_of_frame(result.frame.sequence).await,
            Some(result.z_optimal),
            "object {} frame was not read at its best position",
            result.object_index
        );
        assert_eq!(result.z_readback, Some(result.z_optimal));
        assert!(
            (result.z_optimal - focal_z).abs() <= 1.0,
            "object {} focused at {} (focal plane {})",
            result.object_index,
            result.z_optimal,
            focal_z
        );
        assert!(!result.low_confidence);
        assert!(!result.flat_response);
    }
    // The rig comes back with the job
    assert!(outcome.rig.actuator.is_some());
}

#[tokio::test(start_paused = true)]
async fn results_stream_in_index_order() {
    let (optics, objects) = three_specimens().await;
    let mut job = AutofocusEngine::new(config())
        .start(rig(&optics), objects)
        .unwrap();

    let mut order = Vec::new();
    while let Some(result) = job.next_result().await {
        order.push(result.object_index);
    }
    assert_eq!(order, vec![0, 1, 2]);
    assert_eq!(job.join().await.unwrap().final_state, EngineState::Complete);
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_scan_keeps_earlier_results_and_stops_hardware() {
    let (optics, objects) = three_specimens().await;
    let job = AutofocusEngine::new(config())
        .start(rig(&optics), objects)
        .unwrap();

    let mut state = job.state_watch();
    state
        .wait_for(|s| *s == EngineState::Scanning(1))
        .await
        .unwrap();
    let calls_at_cancel = optics.hardware_calls().await;
    job.cancel();
    assert!(job.is_cancel_requested());

    let outcome = job.join().await.unwrap();
    assert_eq!(outcome.final_state, EngineState::Cancelled);
    let focused: Vec<usize> = outcome.results.iter().map(|r| r.object_index).collect();
    assert_eq!(focused, vec![0]);

    // At most the in-flight move and its frame read complete after the request
    let calls_at_join = optics.hardware_calls().await;
    assert!(
        calls_at_join - calls_at_cancel <= 2,
        "{} hardware calls after cancel",
        calls_at_join - calls_at_cancel
    );
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(optics.hardware_calls().await, calls_at_join);
}

#[traced_test]
#[tokio::test(start_paused = true)]
async fn actuator_failure_aborts_only_that_object() {
    let (optics, objects) = three_specimens().await;
    optics.fail_moves(0..1).await;
    let (events, mut rx) = broadcast::channel(4096);

    let outcome = AutofocusEngine::new(config())
        .with_events(events)
        .start(rig(&optics), objects)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(outcome.final_state, EngineState::Complete);
    let failed: Vec<usize> = outcome.failures.iter().map(|f| f.object_index).collect();
    assert_eq!(failed, vec![0]);
    let focused: Vec<usize> = outcome.results.iter().map(|r| r.object_index).collect();
    assert_eq!(focused, vec![1, 2]);

    let mut failure_events = 0;
    let mut progress_events = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            AcquisitionEvent::AutofocusFailed { object_index, .. } => {
                assert_eq!(object_index, 0);
                failure_events += 1;
            }
            AcquisitionEvent::AutofocusProgress { .. } => progress_events += 1,
            _ => {}
        }
    }
    assert_eq!(failure_events, 1);
    assert!(progress_events > 0);
    assert!(logs_contain("Autofocus failed for object, continuing"));
}

#[tokio::test(start_paused = true)]
async fn transient_actuator_errors_are_retried() {
    let (optics, objects) = three_specimens().await;
    optics.fail_moves(0..2).await;
    let config = AutofocusConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
        },
        ..config()
    };

    let outcome = AutofocusEngine::new(config)
        .start(rig(&optics), objects)
        .unwrap()
        .join()
        .await
        .unwrap();
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.results.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn secondary_capture_returns_axis_to_best_focus() {
    let (optics, objects) = three_specimens().await;
    let config = AutofocusConfig {
        secondary_offset: Some(3.0),
        ..config()
    };

    let outcome = AutofocusEngine::new(config)
        .start(rig(&optics), objects)
        .unwrap()
        .join()
        .await
        .unwrap();

    for result in &outcome.results {
        let secondary = result.secondary.as_ref().unwrap();
        assert_eq!(secondary.z, result.z_optimal + 3.0);
        assert_eq!(
            optics.z_of_frame(secondary.frame.sequence).await,
            Some(secondary.z)
        );
        assert!(secondary.frame.sequence > result.frame.sequence);
    }
    let last = outcome.results.last().unwrap();
    assert_eq!(optics.z().await, last.z_optimal);
}

#[tokio::test(start_paused = true)]
async fn low_scores_are_flagged_not_dropped() {
    let (optics, objects) = three_specimens().await;
    let config = AutofocusConfig {
        min_focus_score: 1e12,
        ..config()
    };

    let outcome = AutofocusEngine::new(config)
        .start(rig(&optics), objects)
        .unwrap()
        .join()
        .await
        .unwrap();
    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.results.iter().all(|r| r.low_confidence));
}

#[tokio::test]
async fn start_fails_fast_and_returns_the_rig() {
    let (optics, objects) = three_specimens().await;
    let engine = AutofocusEngine::new(config());

    let rejected = engine
        .start(FocusRig::without_actuator(Box::new(optics.camera())), objects)
        .unwrap_err();
    assert_eq!(rejected.error, AutofocusError::MissingActuator);
    assert!(rejected.rig.actuator.is_none());

    let rejected = engine.start(rig(&optics), Vec::new()).unwrap_err();
    assert_eq!(rejected.error, AutofocusError::NoObjects);
    assert!(rejected.rig.actuator.is_some());

    let bad = AutofocusEngine::new(AutofocusConfig {
        z_fine_step: 0.0,
        ..config()
    });
    let rejected = bad.start(rig(&optics), vec![object(0, specimen_box(0, 0))]).unwrap_err();
    assert!(matches!(rejected.error, AutofocusError::InvalidConfig(_)));
    assert_eq!(optics.hardware_calls().await, 0);
}

#[tokio::test(start_paused = true)]
async fn hung_actuator_move_fails_that_object_only() {
    let (optics, objects) = three_specimens().await;
    optics.stall_moves(0..1).await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(60),
        AutofocusEngine::new(config())
            .start(rig(&optics), objects)
            .unwrap()
            .join(),
    )
    .await
    .expect("job must finish despite the hung move")
    .unwrap();

    assert_eq!(outcome.final_state, EngineState::Complete);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].object_index, 0);
    assert!(outcome.failures[0].reason.contains("timed out"));
    let focused: Vec<usize> = outcome.results.iter().map(|r| r.object_index).collect();
    assert_eq!(focused, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn actuator_that_never_answers_still_returns_the_rig() {
    let (optics, objects) = three_specimens().await;
    optics.stall_moves(0..usize::MAX).await;

    let job = AutofocusEngine::new(config())
        .start(rig(&optics), objects)
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(60), job.join())
        .await
        .expect("job must finish when every move hangs")
        .unwrap();

    assert_eq!(outcome.final_state, EngineState::Complete);
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.failures.len(), 3);
    assert!(outcome.rig.actuator.is_some());
}

/// Camera whose frames claim more pixels than they carry.
struct ShortFrames;

#[async_trait]
impl FrameSource for ShortFrames {
    async fn current_frame(&self) -> anyhow::Result<Frame> {
        let size = common::FRAME_SIZE;
        let full = PixelBuffer::U8(vec![0; (size * size) as usize]);
        let mut frame = Frame::new(0, size, size, full)?;
        frame.pixels = PixelBuffer::U8(vec![0; 10]);
        Ok(frame)
    }
}

#[tokio::test(start_paused = true)]
async fn inconsistent_frames_fail_the_object_without_panicking() {
    let (optics, objects) = three_specimens().await;
    let rig = FocusRig::new(Box::new(optics.actuator()), Box::new(ShortFrames));

    let outcome = AutofocusEngine::new(config())
        .start(rig, objects)
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(outcome.final_state, EngineState::Complete);
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.failures.len(), 3);
    assert!(outcome.failures[0].reason.contains("frame buffer holds 10 pixels"));
}
