use std::{thread, time::Instant};

use crossbeam_channel::{Receiver, Sender, select};
use thiserror::Error;

use crate::{
    config::EngineConfig,
    liveness::{DetectionHistory, LivenessSession, LivenessStep},
    types::{Detection, Frame, PerformanceMetrics},
};

use super::{
    detector::{FaceDetector, InitRetry, drive_init},
    scheduler::{DetectionBatch, FrameScheduler, TickOutcome},
    worker::OffloadedScheduler,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineCommand {
    Start,
    Advance,
    Reset,
}

/// Read-only view of the engine after a tick.
#[derive(Clone, Debug)]
pub struct EngineSnapshot {
    pub step: LivenessStep,
    pub progress: f32,
    pub overall_progress: f32,
    pub step_completed: [bool; LivenessStep::ALL.len()],
    pub history: DetectionHistory,
    pub ready_to_advance: bool,
    /// Full progress has been shown long enough; the caller should advance.
    pub advance_due: bool,
    pub detections: Vec<Detection>,
    pub metrics: PerformanceMetrics,
    /// False while models load or wait to retry, and after initialisation gave up.
    pub detection_active: bool,
    pub timestamp: Instant,
}

#[derive(Debug, Error)]
#[error("liveness engine has stopped")]
pub struct EngineStopped;

pub struct EngineHandle {
    commands: Sender<EngineCommand>,
    snapshots: Receiver<EngineSnapshot>,
    stop: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EngineHandle {
    pub fn start_check(&self) -> Result<(), EngineStopped> {
        self.send(EngineCommand::Start)
    }

    pub fn advance(&self) -> Result<(), EngineStopped> {
        self.send(EngineCommand::Advance)
    }

    pub fn reset(&self) -> Result<(), EngineStopped> {
        self.send(EngineCommand::Reset)
    }

    fn send(&self, command: EngineCommand) -> Result<(), EngineStopped> {
        self.commands.send(command).map_err(|_| EngineStopped)
    }

    pub fn snapshots(&self) -> &Receiver<EngineSnapshot> {
        &self.snapshots
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the engine thread. Frames are read from `frame_rx` (only the newest is
/// used each tick); snapshots come out of [`EngineHandle::snapshots`].
pub fn start_engine<D: FaceDetector>(
    detector: D,
    config: EngineConfig,
    frame_rx: Receiver<Frame>,
) -> EngineHandle {
    let (command_tx, command_rx) = crossbeam_channel::unbounded();
    let (snapshot_tx, snapshot_rx) = crossbeam_channel::bounded(1);
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);

    log::info!(
        "starting liveness engine: {} fps, {:?} throttling, offloaded: {}",
        config.target_fps,
        config.performance.throttling_level,
        config.performance.use_alternate_execution_context
    );

    let publisher = SnapshotPublisher {
        tx: snapshot_tx,
        stale: snapshot_rx.clone(),
    };
    let handle = thread::spawn(move || {
        run_engine_loop(detector, config, frame_rx, command_rx, publisher, stop_rx)
    });

    EngineHandle {
        commands: command_tx,
        snapshots: snapshot_rx,
        stop: stop_tx,
        handle: Some(handle),
    }
}

enum Driver<D: FaceDetector> {
    Cooperative {
        scheduler: FrameScheduler<D>,
        init: InitRetry,
    },
    Offloaded(OffloadedScheduler),
}

impl<D: FaceDetector> Driver<D> {
    fn new(detector: D, config: &EngineConfig, now: Instant) -> Self {
        if config.performance.use_alternate_execution_context {
            return Driver::Offloaded(OffloadedScheduler::new(detector, config));
        }

        Driver::Cooperative {
            scheduler: FrameScheduler::new(detector, config),
            init: InitRetry::new(config.init_retry, now),
        }
    }

    fn tick(&mut self, frame: Option<Frame>, now: Instant) -> Option<DetectionBatch> {
        match self {
            Driver::Cooperative { scheduler, init } => {
                scheduler.record_tick(now);
                drive_init(init, scheduler.detector_mut(), now);
                if !init.is_ready() {
                    return None;
                }
                match scheduler.tick(&frame?, now) {
                    TickOutcome::Processed(batch) => Some(batch),
                    TickOutcome::Skipped(_) => None,
                }
            }
            Driver::Offloaded(scheduler) => scheduler.tick(frame, now),
        }
    }

    fn detection_active(&self) -> bool {
        match self {
            Driver::Cooperative { init, .. } => init.is_ready(),
            Driver::Offloaded(scheduler) => scheduler.detection_active(),
        }
    }

    fn metrics(&self) -> PerformanceMetrics {
        match self {
            Driver::Cooperative { scheduler, .. } => scheduler.metrics(),
            Driver::Offloaded(scheduler) => scheduler.metrics(),
        }
    }

    fn shutdown(self) {
        if let Driver::Offloaded(scheduler) = self {
            scheduler.shutdown();
        }
    }
}

fn run_engine_loop<D: FaceDetector>(
    detector: D,
    config: EngineConfig,
    frame_rx: Receiver<Frame>,
    command_rx: Receiver<EngineCommand>,
    publisher: SnapshotPublisher,
    stop_rx: Receiver<()>,
) {
    let mut session = LivenessSession::new(config.step_timeout);
    let mut driver = Driver::new(detector, &config, Instant::now());

    let ticker = crossbeam_channel::tick(config.frame_interval());
    let mut detections: Vec<Detection> = Vec::new();

    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => {}
        }

        let now = Instant::now();
        for command in command_rx.try_iter() {
            apply_command(&mut session, command, now);
        }

        if let Some(batch) = driver.tick(latest_frame(&frame_rx), now) {
            session.process_detections(&batch.detections, batch.frame_size, now);
            detections = batch.detections;
        }

        let snapshot = EngineSnapshot {
            step: session.current_step(),
            progress: session.progress(),
            overall_progress: session.overall_progress(),
            step_completed: session.step_completed(),
            history: *session.history(),
            ready_to_advance: session.ready_to_advance(),
            advance_due: session.advance_due(now, config.advance_delay),
            detections: detections.clone(),
            metrics: driver.metrics(),
            detection_active: driver.detection_active(),
            timestamp: now,
        };
        publisher.publish(snapshot);
    }

    driver.shutdown();
    log::info!("liveness engine stopped");
}

/// Single-slot snapshot channel where a newer snapshot replaces an unread one.
struct SnapshotPublisher {
    tx: Sender<EngineSnapshot>,
    stale: Receiver<EngineSnapshot>,
}

impl SnapshotPublisher {
    fn publish(&self, snapshot: EngineSnapshot) {
        let _ = self.stale.try_recv();
        let _ = self.tx.try_send(snapshot);
    }
}

fn apply_command(session: &mut LivenessSession, command: EngineCommand, now: Instant) {
    match command {
        EngineCommand::Start => {
            if let Err(err) = session.start(now) {
                log::warn!("ignoring start command: {err}");
            }
        }
        EngineCommand::Advance => session.advance(now),
        EngineCommand::Reset => session.reset(),
    }
}

fn latest_frame(frame_rx: &Receiver<Frame>) -> Option<Frame> {
    frame_rx.try_iter().last()
}
