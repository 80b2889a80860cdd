use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded};
use liveness_check::{
    config::{EngineConfig, PerformanceConfig, RetryPolicy, ThrottlingLevel},
    liveness::LivenessStep,
    pipeline::{EngineHandle, EngineSnapshot, start_engine},
    synthetic::{FacePose, SharedPose, SimulatedDetector, scripted_pose},
    types::Frame,
};

const DEADLINE: Duration = Duration::from_secs(30);

fn fast_config(offload: bool) -> EngineConfig {
    let mut performance = PerformanceConfig::from_level(ThrottlingLevel::Responsive);
    performance.use_alternate_execution_context = offload;

    EngineConfig {
        performance,
        target_fps: 60,
        advance_delay: Duration::from_millis(50),
        init_retry: RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(5),
        },
        ..EngineConfig::default()
    }
}

fn frames() -> (Sender<Frame>, Receiver<Frame>) {
    bounded(1)
}

fn feed(frame_tx: &Sender<Frame>) {
    let _ = frame_tx.try_send(Frame::blank(640, 480, Instant::now()));
}

fn next_snapshot(engine: &EngineHandle, frame_tx: &Sender<Frame>) -> EngineSnapshot {
    feed(frame_tx);
    engine
        .snapshots()
        .recv_timeout(Duration::from_secs(2))
        .expect("engine publishes a snapshot every tick")
}

fn wait_until(
    engine: &EngineHandle,
    frame_tx: &Sender<Frame>,
    mut done: impl FnMut(&EngineSnapshot) -> bool,
) -> EngineSnapshot {
    let deadline = Instant::now() + DEADLINE;
    loop {
        let snapshot = next_snapshot(engine, frame_tx);
        if done(&snapshot) {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "engine stuck at {:?}", snapshot.step);
    }
}

/// Play a cooperative user through every step and return the final snapshot.
fn run_full_check(engine: &EngineHandle, frame_tx: &Sender<Frame>, pose: &SharedPose) -> EngineSnapshot {
    engine.start_check().unwrap();

    let mut entered: Option<(LivenessStep, Instant)> = None;
    let mut advanced_from = None;
    let mut overall = 0.0f32;

    wait_until(engine, frame_tx, |snapshot| {
        assert!(
            snapshot.overall_progress >= overall || snapshot.step == LivenessStep::Intro,
            "overall progress went backwards"
        );
        assert!((0.0..=100.0).contains(&snapshot.progress));
        overall = snapshot.overall_progress;

        if entered.map(|(step, _)| step) != Some(snapshot.step) {
            entered = Some((snapshot.step, Instant::now()));
        }
        if let Some((step, at)) = entered {
            *pose.lock().unwrap() = Some(scripted_pose(step, at.elapsed()));
        }

        if snapshot.advance_due && advanced_from != Some(snapshot.step) {
            advanced_from = Some(snapshot.step);
            engine.advance().unwrap();
        }

        snapshot.step == LivenessStep::Completed
    })
}

#[test]
fn test_cooperative_user_completes_check() {
    let pose: SharedPose = Arc::new(Mutex::new(Some(FacePose::default())));
    let (frame_tx, frame_rx) = frames();
    let engine = start_engine(SimulatedDetector::new(pose.clone()), fast_config(false), frame_rx);

    let done = run_full_check(&engine, &frame_tx, &pose);
    assert_eq!(done.overall_progress, 100.0);
    assert!(done.step_completed[1..6].iter().all(|completed| *completed));
    assert!(done.history.blink_detected);
    assert!(done.history.left_turn_detected);
    assert!(done.history.right_turn_detected);
    assert!(done.history.smile_detected);
    assert!(done.detection_active);

    engine.stop();
}

#[test]
fn test_offloaded_detection_completes_check() {
    let pose: SharedPose = Arc::new(Mutex::new(Some(FacePose::default())));
    let (frame_tx, frame_rx) = frames();
    let engine = start_engine(SimulatedDetector::new(pose.clone()), fast_config(true), frame_rx);

    wait_until(&engine, &frame_tx, |snapshot| snapshot.detection_active);
    let done = run_full_check(&engine, &frame_tx, &pose);
    assert_eq!(done.step, LivenessStep::Completed);
}

#[test]
fn test_reset_returns_to_intro() {
    let pose: SharedPose = Arc::new(Mutex::new(Some(FacePose::default())));
    let (frame_tx, frame_rx) = frames();
    let engine = start_engine(SimulatedDetector::new(pose), fast_config(false), frame_rx);

    engine.start_check().unwrap();
    wait_until(&engine, &frame_tx, |snapshot| {
        snapshot.step == LivenessStep::FaceAlignment && snapshot.ready_to_advance
    });

    engine.reset().unwrap();
    let snapshot = wait_until(&engine, &frame_tx, |snapshot| snapshot.step == LivenessStep::Intro);
    assert_eq!(snapshot.progress, 0.0);
    assert_eq!(snapshot.step_completed, [false; 7]);
    assert_eq!(snapshot.overall_progress, 0.0);
}

#[test]
fn test_no_face_makes_no_progress() {
    let pose: SharedPose = Arc::new(Mutex::new(None));
    let (frame_tx, frame_rx) = frames();
    let engine = start_engine(SimulatedDetector::new(pose), fast_config(false), frame_rx);

    engine.start_check().unwrap();
    wait_until(&engine, &frame_tx, |snapshot| snapshot.step == LivenessStep::FaceAlignment);

    for _ in 0..20 {
        let snapshot = next_snapshot(&engine, &frame_tx);
        assert!(snapshot.detections.is_empty());
        assert_eq!(snapshot.progress, 0.0);
        assert!(!snapshot.ready_to_advance);
    }
}

#[test]
fn test_failed_initialisation_leaves_detection_inactive() {
    let pose: SharedPose = Arc::new(Mutex::new(Some(FacePose::default())));
    let detector = SimulatedDetector::new(pose).with_init_failures(u32::MAX);
    let (frame_tx, frame_rx) = frames();
    let engine = start_engine(detector, fast_config(false), frame_rx);

    engine.start_check().unwrap();
    wait_until(&engine, &frame_tx, |snapshot| snapshot.step == LivenessStep::FaceAlignment);

    for _ in 0..10 {
        let snapshot = next_snapshot(&engine, &frame_tx);
        assert!(!snapshot.detection_active);
        assert!(snapshot.detections.is_empty());
        assert_eq!(snapshot.progress, 0.0);
        assert!(snapshot.metrics.fps > 0.0);
    }
}

#[test]
fn test_snapshots_continue_while_initialisation_backs_off() {
    let pose: SharedPose = Arc::new(Mutex::new(Some(FacePose::default())));
    let detector = SimulatedDetector::new(pose).with_init_failures(1);
    let backoff = Duration::from_millis(1500);
    let config = EngineConfig {
        init_retry: RetryPolicy {
            max_retries: 2,
            backoff,
        },
        ..fast_config(false)
    };
    let (frame_tx, frame_rx) = frames();
    let started = Instant::now();
    let engine = start_engine(detector, config, frame_rx);

    engine.start_check().unwrap();
    let snapshot = wait_until(&engine, &frame_tx, |snapshot| {
        snapshot.step == LivenessStep::FaceAlignment
    });
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!snapshot.detection_active);

    wait_until(&engine, &frame_tx, |snapshot| snapshot.detection_active);
    assert!(started.elapsed() >= backoff);
}

#[test]
fn test_stop_during_initialisation_backoff() {
    let pose: SharedPose = Arc::new(Mutex::new(Some(FacePose::default())));
    let detector = SimulatedDetector::new(pose).with_init_failures(u32::MAX);
    let config = EngineConfig {
        init_retry: RetryPolicy {
            max_retries: 5,
            backoff: Duration::from_secs(30),
        },
        ..fast_config(false)
    };
    let (_frame_tx, frame_rx) = frames();
    let engine = start_engine(detector, config, frame_rx);

    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    engine.stop();
    assert!(started.elapsed() < Duration::from_secs(5));
}
