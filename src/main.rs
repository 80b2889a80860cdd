use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use crossbeam_channel::{Sender, bounded};
use liveness_check::{
    config::EngineConfig,
    liveness::LivenessStep,
    pipeline::start_engine,
    synthetic::{SharedPose, SimulatedDetector, scripted_pose},
    types::Frame,
};

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;
const DEMO_TIMEOUT: Duration = Duration::from_secs(60);

/// Stand-in for a camera: pushes blank frames at a fixed rate.
struct FrameFeed {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FrameFeed {
    fn start(frame_tx: Sender<Frame>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                let frame = Frame::blank(FRAME_WIDTH, FRAME_HEIGHT, Instant::now());
                // Drop if the engine is busy.
                let _ = frame_tx.try_send(frame);
                thread::sleep(interval);
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for FrameFeed {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let config = EngineConfig::from_env()?;
    let pose: SharedPose = Arc::new(Mutex::new(Some(Default::default())));

    let (frame_tx, frame_rx) = bounded(1);
    let _feed = FrameFeed::start(frame_tx, config.frame_interval());
    let engine = start_engine(SimulatedDetector::new(pose.clone()), config, frame_rx);

    engine.start_check()?;
    let started = Instant::now();
    let mut current: Option<(LivenessStep, Instant)> = None;
    let mut advanced_from = None;

    while started.elapsed() < DEMO_TIMEOUT {
        let Ok(snapshot) = engine.snapshots().recv_timeout(Duration::from_millis(500)) else {
            continue;
        };

        if current.map(|(step, _)| step) != Some(snapshot.step) {
            log::info!(
                "[{:>3.0}%] {}: {}",
                snapshot.overall_progress,
                snapshot.step.label(),
                snapshot.step.instruction()
            );
            current = Some((snapshot.step, snapshot.timestamp));
        }

        if snapshot.step == LivenessStep::Completed {
            log::info!("liveness verified in {:.1}s", started.elapsed().as_secs_f32());
            engine.stop();
            return Ok(());
        }

        if let Some((step, entered)) = current {
            let next = scripted_pose(step, snapshot.timestamp.saturating_duration_since(entered));
            *pose.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(next);
        }

        if snapshot.advance_due && advanced_from != Some(snapshot.step) {
            log::info!(
                "{} passed ({:.0} fps, detect {:.1} ms)",
                snapshot.step.label(),
                snapshot.metrics.fps,
                snapshot.metrics.detect_time_ms
            );
            advanced_from = Some(snapshot.step);
            engine.advance()?;
        }
    }

    bail!("liveness check did not complete within {DEMO_TIMEOUT:?}")
}
