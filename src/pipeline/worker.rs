//! Detection on a dedicated thread, driven by a typed request/response protocol.

use std::{
    collections::HashMap,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use thiserror::Error;

use crate::{
    config::{EngineConfig, ModelSettings, PerformanceConfig},
    types::{Frame, FrameSize, PerformanceMetrics},
};

use super::{
    budget::FrameBudget,
    detector::{FaceDetector, InitRetry, RawFace, run_detector_pass},
    scheduler::{DetectionBatch, DetectionTracker, millis},
};

const MAX_PENDING_REQUESTS: usize = 1;
const REQUEST_QUEUE: usize = 2;

#[derive(Debug)]
pub enum WorkerRequest {
    Init,
    Detect {
        frame: Frame,
        detection_confidence: f32,
        max_faces: usize,
        with_landmarks: bool,
        id: u64,
    },
}

#[derive(Clone, Debug)]
pub enum WorkerResponse {
    Ready,
    Initialized { success: bool },
    /// Times are measured on the worker around the detector pass itself.
    DetectionResult {
        faces: Vec<RawFace>,
        detect_time: Duration,
        landmark_time: Option<Duration>,
        id: u64,
    },
    Error {
        message: String,
        id: Option<u64>,
        detect_time: Option<Duration>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("a detection request is already pending")]
    Busy,
    #[error("detection worker is not running")]
    Disconnected,
    #[error("detection worker has not initialised its models")]
    NotInitialized,
}

/// Worker responses after correlation with the request that caused them.
#[derive(Clone, Debug)]
pub enum WorkerEvent {
    Ready,
    Initialized {
        success: bool,
    },
    Detected {
        faces: Vec<RawFace>,
        frame_size: FrameSize,
        detect_time: Duration,
        landmark_time: Option<Duration>,
    },
    DetectFailed {
        message: String,
        frame_size: FrameSize,
        detect_time: Duration,
    },
    Error {
        message: String,
    },
}

struct PendingRequest {
    frame_size: FrameSize,
}

pub struct DetectionWorker {
    requests: Option<Sender<WorkerRequest>>,
    responses: Receiver<WorkerResponse>,
    handle: Option<thread::JoinHandle<()>>,
    pending: HashMap<u64, PendingRequest>,
    next_id: u64,
    initialized: bool,
}

impl DetectionWorker {
    pub fn spawn<D: FaceDetector>(detector: D) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::bounded(REQUEST_QUEUE);
        let (response_tx, response_rx) = crossbeam_channel::unbounded();

        log::info!("starting detection worker");
        let handle = thread::spawn(move || run_worker_loop(detector, request_rx, response_tx));

        Self {
            requests: Some(request_tx),
            responses: response_rx,
            handle: Some(handle),
            pending: HashMap::new(),
            next_id: 0,
            initialized: false,
        }
    }

    pub fn initialize(&mut self) -> Result<(), WorkerError> {
        self.send(WorkerRequest::Init)
    }

    /// Hand `frame` to the worker. Returns the request id.
    pub fn submit(
        &mut self,
        frame: Frame,
        settings: &ModelSettings,
        with_landmarks: bool,
    ) -> Result<u64, WorkerError> {
        if !self.initialized {
            return Err(WorkerError::NotInitialized);
        }
        if self.pending.len() >= MAX_PENDING_REQUESTS {
            return Err(WorkerError::Busy);
        }

        let id = self.next_id;
        let frame_size = frame.size();
        self.send(WorkerRequest::Detect {
            frame,
            detection_confidence: settings.detection_confidence,
            max_faces: settings.max_faces,
            with_landmarks,
            id,
        })?;

        self.next_id += 1;
        self.pending.insert(id, PendingRequest { frame_size });
        Ok(id)
    }

    fn send(&self, request: WorkerRequest) -> Result<(), WorkerError> {
        let requests = self.requests.as_ref().ok_or(WorkerError::Disconnected)?;
        requests.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) => WorkerError::Busy,
            TrySendError::Disconnected(_) => WorkerError::Disconnected,
        })
    }

    /// Collect every response received so far without blocking.
    pub fn poll(&mut self) -> Result<Vec<WorkerEvent>, WorkerError> {
        let mut events = Vec::new();
        loop {
            match self.responses.try_recv() {
                Ok(response) => events.extend(self.handle_response(response)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if events.is_empty() {
                        return Err(WorkerError::Disconnected);
                    }
                    break;
                }
            }
        }
        Ok(events)
    }

    fn handle_response(&mut self, response: WorkerResponse) -> Option<WorkerEvent> {
        match response {
            WorkerResponse::Ready => Some(WorkerEvent::Ready),
            WorkerResponse::Initialized { success } => {
                self.initialized = success;
                Some(WorkerEvent::Initialized { success })
            }
            WorkerResponse::DetectionResult {
                faces,
                detect_time,
                landmark_time,
                id,
            } => {
                let Some(request) = self.pending.remove(&id) else {
                    log::debug!("ignoring detection result for unknown request {id}");
                    return None;
                };
                Some(WorkerEvent::Detected {
                    faces,
                    frame_size: request.frame_size,
                    detect_time,
                    landmark_time,
                })
            }
            WorkerResponse::Error {
                message,
                id: Some(id),
                detect_time,
            } => {
                let Some(request) = self.pending.remove(&id) else {
                    log::debug!("ignoring error for unknown request {id}: {message}");
                    return None;
                };
                Some(WorkerEvent::DetectFailed {
                    message,
                    frame_size: request.frame_size,
                    detect_time: detect_time.unwrap_or_default(),
                })
            }
            WorkerResponse::Error {
                message, id: None, ..
            } => Some(WorkerEvent::Error { message }),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Close the request channel, wait for the thread and forget pending requests.
    pub fn terminate(&mut self) {
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.pending.clear();
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_worker_loop<D: FaceDetector>(
    mut detector: D,
    requests: Receiver<WorkerRequest>,
    responses: Sender<WorkerResponse>,
) {
    if responses.send(WorkerResponse::Ready).is_err() {
        return;
    }

    for request in requests.iter() {
        let reply = match request {
            WorkerRequest::Init => match detector.init() {
                Ok(()) => vec![WorkerResponse::Initialized { success: true }],
                Err(err) => vec![
                    WorkerResponse::Error {
                        message: format!("{err:#}"),
                        id: None,
                        detect_time: None,
                    },
                    WorkerResponse::Initialized { success: false },
                ],
            },
            WorkerRequest::Detect {
                frame,
                detection_confidence,
                max_faces,
                with_landmarks,
                id,
            } => {
                let started = Instant::now();
                match run_detector_pass(
                    &mut detector,
                    &frame,
                    detection_confidence,
                    max_faces,
                    with_landmarks,
                ) {
                    Ok(pass) => vec![WorkerResponse::DetectionResult {
                        faces: pass.faces,
                        detect_time: pass.detect_time,
                        landmark_time: pass.landmark_time,
                        id,
                    }],
                    Err(err) => vec![WorkerResponse::Error {
                        message: format!("{err:#}"),
                        id: Some(id),
                        detect_time: Some(started.elapsed()),
                    }],
                }
            }
        };

        for response in reply {
            if responses.send(response).is_err() {
                return;
            }
        }
    }

    log::info!("detection worker stopped");
}

/// Scheduler counterpart of [`super::FrameScheduler`] for offloaded detection:
/// frames go to the worker and results are picked up on later ticks.
pub struct OffloadedScheduler {
    worker: DetectionWorker,
    settings: ModelSettings,
    performance: PerformanceConfig,
    budget: FrameBudget,
    tracker: DetectionTracker,
    metrics: PerformanceMetrics,
    init: InitRetry,
    last_init_error: Option<String>,
}

impl OffloadedScheduler {
    pub fn new<D: FaceDetector>(detector: D, config: &EngineConfig) -> Self {
        let now = Instant::now();
        let mut scheduler = Self {
            worker: DetectionWorker::spawn(detector),
            settings: config.model.clone(),
            performance: config.performance.clone(),
            budget: FrameBudget::new(config.frame_interval(), config.performance.max_skip_frames),
            tracker: DetectionTracker::default(),
            metrics: PerformanceMetrics::default(),
            init: InitRetry::new(config.init_retry, now),
            last_init_error: None,
        };
        scheduler.drive_init(now);
        scheduler
    }

    /// Pick up finished work, drive model initialisation, then submit `frame` if
    /// the budget allows.
    pub fn tick(&mut self, frame: Option<Frame>, now: Instant) -> Option<DetectionBatch> {
        self.metrics.fps = self.budget.record_tick(now);
        let batch = self.drain_events(now);
        self.drive_init(now);

        if let Some(frame) = frame {
            if self.init.is_ready() {
                self.submit(frame, now);
            }
        }

        batch
    }

    fn drain_events(&mut self, now: Instant) -> Option<DetectionBatch> {
        let events = match self.worker.poll() {
            Ok(events) => events,
            Err(err) => {
                if !self.init.has_failed() {
                    log::error!("detection worker lost: {err}");
                    self.init.abandon();
                }
                self.budget.abort();
                return None;
            }
        };

        let mut batch = None;
        for event in events {
            match event {
                WorkerEvent::Ready => log::debug!("detection worker ready"),
                WorkerEvent::Initialized { success: true } => {
                    self.init.record(Ok(()), now);
                }
                WorkerEvent::Initialized { success: false } => {
                    let message = self
                        .last_init_error
                        .take()
                        .unwrap_or_else(|| "no error reported".to_string());
                    self.init.record(Err(message), now);
                }
                WorkerEvent::Error { message } => {
                    log::warn!("detection worker reported: {message}");
                    self.last_init_error = Some(message);
                }
                WorkerEvent::Detected {
                    faces,
                    frame_size,
                    detect_time,
                    landmark_time,
                } => {
                    let landmarks_fresh = faces.iter().any(|face| face.landmarks.is_some());
                    let detections = self.tracker.finalize(
                        faces,
                        landmarks_fresh,
                        now,
                        &self.settings,
                        &self.performance,
                    );
                    self.metrics.detect_time_ms = millis(detect_time);
                    self.metrics.landmark_time_ms = landmark_time.map_or(0.0, millis);
                    self.budget.finish(detect_time);
                    batch = Some(DetectionBatch {
                        detections,
                        frame_size,
                    });
                }
                WorkerEvent::DetectFailed {
                    message,
                    frame_size,
                    detect_time,
                } => {
                    log::warn!("face detection failed in worker: {message}");
                    self.metrics.detect_time_ms = millis(detect_time);
                    self.budget.finish(detect_time);
                    batch = Some(DetectionBatch {
                        detections: Vec::new(),
                        frame_size,
                    });
                }
            }
        }

        batch
    }

    fn drive_init(&mut self, now: Instant) {
        if !self.init.begin(now) {
            return;
        }
        if let Err(err) = self.worker.initialize() {
            log::error!("failed to request face model initialisation: {err}");
            self.init.abandon();
        }
    }

    fn submit(&mut self, frame: Frame, now: Instant) {
        if self.budget.try_begin().is_err() {
            return;
        }

        let with_landmarks = self.settings.landmarks_enabled
            && self
                .tracker
                .landmarks_due(now, self.performance.landmark_throttle);

        match self.worker.submit(frame, &self.settings, with_landmarks) {
            Ok(_) => {
                if with_landmarks {
                    self.tracker.note_landmark_run(now);
                }
            }
            Err(err) => {
                log::warn!("could not hand frame to detection worker: {err}");
                self.budget.abort();
            }
        }
    }

    pub fn detection_active(&self) -> bool {
        self.init.is_ready()
    }

    pub fn has_failed(&self) -> bool {
        self.init.has_failed()
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics
    }

    pub fn shutdown(mut self) {
        self.worker.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RetryPolicy, synthetic::{FacePose, SharedPose, SimulatedDetector}};
    use std::sync::{Arc, Mutex};

    const DEADLINE: Duration = Duration::from_secs(5);

    fn present() -> SharedPose {
        Arc::new(Mutex::new(Some(FacePose::default())))
    }

    fn wait_for_event(
        worker: &mut DetectionWorker,
        mut matches: impl FnMut(&WorkerEvent) -> bool,
    ) -> WorkerEvent {
        let deadline = Instant::now() + DEADLINE;
        while Instant::now() < deadline {
            for event in worker.poll().unwrap() {
                if matches(&event) {
                    return event;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("worker event did not arrive in time");
    }

    fn initialized(detector: SimulatedDetector) -> DetectionWorker {
        let mut worker = DetectionWorker::spawn(detector);
        worker.initialize().unwrap();
        wait_for_event(&mut worker, |event| {
            matches!(event, WorkerEvent::Initialized { .. })
        });
        worker
    }

    #[test]
    fn test_submit_requires_initialisation() {
        let mut worker = DetectionWorker::spawn(SimulatedDetector::new(present()));
        let frame = Frame::blank(640, 480, Instant::now());

        assert_eq!(
            worker.submit(frame, &ModelSettings::default(), true),
            Err(WorkerError::NotInitialized)
        );
    }

    #[test]
    fn test_detect_round_trip() {
        let mut worker = initialized(SimulatedDetector::new(present()));
        assert!(worker.is_initialized());

        let now = Instant::now();
        let id = worker
            .submit(Frame::blank(640, 480, now), &ModelSettings::default(), true)
            .unwrap();
        assert_eq!(worker.pending(), 1);
        assert_eq!(
            worker.submit(Frame::blank(640, 480, now), &ModelSettings::default(), true),
            Err(WorkerError::Busy)
        );

        let event = wait_for_event(&mut worker, |event| matches!(event, WorkerEvent::Detected { .. }));
        let WorkerEvent::Detected {
            faces, frame_size, ..
        } = event
        else {
            unreachable!();
        };
        assert_eq!(faces.len(), 1);
        assert!(faces[0].landmarks.is_some());
        assert_eq!(frame_size, FrameSize::new(640.0, 480.0));
        assert_eq!(worker.pending(), 0);
        assert_eq!(id, 0);
    }

    #[test]
    fn test_failed_detection_is_correlated() {
        let mut worker = initialized(SimulatedDetector::new(present()).with_failing_detection());
        let now = Instant::now();
        worker
            .submit(Frame::blank(320, 240, now), &ModelSettings::default(), false)
            .unwrap();

        let event =
            wait_for_event(&mut worker, |event| matches!(event, WorkerEvent::DetectFailed { .. }));
        assert!(matches!(event, WorkerEvent::DetectFailed { frame_size, .. } if frame_size.width == 320.0));
        assert_eq!(worker.pending(), 0);
    }

    #[test]
    fn test_init_failure_reports_error_first() {
        let mut worker = DetectionWorker::spawn(SimulatedDetector::new(present()).with_init_failures(1));
        worker.initialize().unwrap();

        let mut seen = Vec::new();
        let deadline = Instant::now() + DEADLINE;
        while !seen
            .iter()
            .any(|event| matches!(event, WorkerEvent::Initialized { .. }))
        {
            assert!(Instant::now() < deadline, "initialisation never answered");
            seen.extend(worker.poll().unwrap());
            thread::sleep(Duration::from_millis(1));
        }

        let error_at = seen
            .iter()
            .position(|event| matches!(event, WorkerEvent::Error { .. }))
            .unwrap();
        let init_at = seen
            .iter()
            .position(|event| matches!(event, WorkerEvent::Initialized { success: false }))
            .unwrap();
        assert!(error_at < init_at);
        assert!(!worker.is_initialized());
    }

    #[test]
    fn test_unknown_ids_are_ignored() {
        let mut worker = DetectionWorker::spawn(SimulatedDetector::new(present()));
        let event = worker.handle_response(WorkerResponse::DetectionResult {
            faces: Vec::new(),
            detect_time: Duration::ZERO,
            landmark_time: None,
            id: 42,
        });
        assert!(event.is_none());

        let event = worker.handle_response(WorkerResponse::Error {
            message: "stale".to_string(),
            id: Some(42),
            detect_time: None,
        });
        assert!(event.is_none());
    }

    #[test]
    fn test_terminate_abandons_pending() {
        let mut worker = initialized(SimulatedDetector::new(present()));
        let now = Instant::now();
        worker
            .submit(Frame::blank(640, 480, now), &ModelSettings::default(), false)
            .unwrap();

        worker.terminate();
        assert_eq!(worker.pending(), 0);
        assert_eq!(
            worker.submit(Frame::blank(640, 480, now), &ModelSettings::default(), false),
            Err(WorkerError::Disconnected)
        );
    }

    fn quick_config(max_retries: u32) -> EngineConfig {
        EngineConfig {
            init_retry: RetryPolicy {
                max_retries,
                backoff: Duration::from_millis(1),
            },
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_offloaded_scheduler_delivers_batches() {
        let mut scheduler = OffloadedScheduler::new(SimulatedDetector::new(present()), &quick_config(0));
        let deadline = Instant::now() + DEADLINE;

        let batch = loop {
            assert!(Instant::now() < deadline, "no batch produced");
            let now = Instant::now();
            if let Some(batch) = scheduler.tick(Some(Frame::blank(640, 480, now)), now) {
                break batch;
            }
            thread::sleep(Duration::from_millis(2));
        };

        assert!(scheduler.detection_active());
        assert_eq!(batch.detections.len(), 1);
        assert!(batch.detections[0].has_full_mesh());
        assert!(batch.detections[0].features.is_some());
        scheduler.shutdown();
    }

    #[test]
    fn test_offloaded_init_retries_then_gives_up() {
        let detector = SimulatedDetector::new(present()).with_init_failures(10);
        let mut scheduler = OffloadedScheduler::new(detector, &quick_config(2));
        let deadline = Instant::now() + DEADLINE;

        while !scheduler.has_failed() {
            assert!(Instant::now() < deadline, "initialisation never gave up");
            scheduler.tick(None, Instant::now());
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!scheduler.detection_active());
        assert!(scheduler.metrics().fps > 0.0);
    }

    #[test]
    fn test_fast_offloaded_detection_keeps_every_frame() {
        let config = quick_config(0);
        let interval = config.frame_interval();
        let mut scheduler = OffloadedScheduler::new(SimulatedDetector::new(present()), &config);
        let deadline = Instant::now() + DEADLINE;

        loop {
            assert!(Instant::now() < deadline, "no batch produced");
            let now = Instant::now();
            if scheduler.tick(Some(Frame::blank(640, 480, now)), now).is_some() {
                break;
            }
            thread::sleep(interval + Duration::from_millis(10));
        }

        // Detection time excludes the wait for the next tick, so no skips are due
        // and the tick that collected the result already submitted its own frame.
        assert_eq!(scheduler.budget.skip_remaining(), 0);
        assert!(scheduler.metrics().detect_time_ms < millis(interval));
        assert_eq!(scheduler.worker.pending(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_offloaded_init_recovers_after_retry() {
        let detector = SimulatedDetector::new(present()).with_init_failures(1);
        let mut scheduler = OffloadedScheduler::new(detector, &quick_config(3));
        let deadline = Instant::now() + DEADLINE;

        while !scheduler.detection_active() {
            assert!(Instant::now() < deadline, "initialisation never recovered");
            assert!(!scheduler.has_failed());
            scheduler.tick(None, Instant::now());
            thread::sleep(Duration::from_millis(2));
        }
    }
}
