mod budget;
mod detector;
mod engine;
mod scheduler;
mod worker;

pub use budget::{FrameBudget, SkipReason, next_skip_count};
pub use detector::{
    DetectorPass, FaceDetector, InitError, InitRetry, InitState, RawFace, attach_landmarks,
    drive_init, prepare_faces, run_detector_pass,
};
pub use engine::{EngineCommand, EngineHandle, EngineSnapshot, EngineStopped, start_engine};
pub use scheduler::{DetectionBatch, DetectionTracker, FrameScheduler, TickOutcome};
pub use worker::{
    DetectionWorker, OffloadedScheduler, WorkerError, WorkerEvent, WorkerRequest, WorkerResponse,
};
