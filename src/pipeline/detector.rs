use std::time::{Duration, Instant};

use thiserror::Error;

use crate::{
    config::RetryPolicy,
    matcher::{LANDMARK_ATTACH_IOU, best_match},
    types::{Detection, FaceBox, Frame, FrameSize, Landmark},
};

/// Share of the box size added around each detector box before it is used.
const BOX_EXPANSION: f32 = 0.1;

/// Face detector plus face-mesh model. Implementations are moved onto the thread
/// that runs them.
pub trait FaceDetector: Send + 'static {
    /// Load models. Called before the first detection and again on retry.
    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn detect(
        &mut self,
        frame: &Frame,
        min_confidence: f32,
        max_faces: usize,
    ) -> anyhow::Result<Vec<RawFace>>;

    /// One mesh per face found in the frame, in frame pixel coordinates.
    fn estimate_landmarks(&mut self, frame: &Frame) -> anyhow::Result<Vec<Vec<Landmark>>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawFace {
    pub bbox: FaceBox,
    pub probability: f32,
    pub landmarks: Option<Vec<Landmark>>,
}

impl From<RawFace> for Detection {
    fn from(face: RawFace) -> Self {
        let detection = Detection::new(face.bbox, face.probability);
        match face.landmarks {
            Some(landmarks) => detection.with_landmarks(landmarks),
            None => detection,
        }
    }
}

/// Drop weak or malformed predictions, cap the count, then clamp and pad each
/// box inside the frame.
pub fn prepare_faces(
    raw: Vec<RawFace>,
    frame: FrameSize,
    min_confidence: f32,
    max_faces: usize,
) -> Vec<RawFace> {
    raw.into_iter()
        .filter(|face| face.probability >= min_confidence && face.bbox.is_finite())
        .take(max_faces)
        .map(|face| RawFace {
            bbox: face.bbox.clamp_to(frame).expand(BOX_EXPANSION, frame),
            ..face
        })
        .collect()
}

/// Give each face the mesh whose enclosing box overlaps it best.
pub fn attach_landmarks(faces: &mut [RawFace], meshes: Vec<Vec<Landmark>>) {
    let candidates: Vec<(FaceBox, Vec<Landmark>)> = meshes
        .into_iter()
        .filter_map(|mesh| FaceBox::enclosing(&mesh).map(|bbox| (bbox, mesh)))
        .collect();

    for face in faces.iter_mut() {
        let matched = best_match(
            &face.bbox,
            candidates.iter().map(|(bbox, mesh)| (*bbox, mesh)),
            LANDMARK_ATTACH_IOU,
        );
        if let Some((mesh, _)) = matched {
            face.landmarks = Some(mesh.clone());
        }
    }
}

#[derive(Clone, Debug)]
pub struct DetectorPass {
    pub faces: Vec<RawFace>,
    /// Landmarks were estimated on this frame rather than left for carry-over.
    pub landmarks_fresh: bool,
    pub detect_time: Duration,
    /// `None` when the landmark model was not run.
    pub landmark_time: Option<Duration>,
}

/// Detect faces and, when asked and there is at least one face, estimate their
/// meshes. A landmark failure is logged and leaves the faces without landmarks.
pub fn run_detector_pass<D: FaceDetector + ?Sized>(
    detector: &mut D,
    frame: &Frame,
    min_confidence: f32,
    max_faces: usize,
    with_landmarks: bool,
) -> anyhow::Result<DetectorPass> {
    let started = Instant::now();
    let raw = detector.detect(frame, min_confidence, max_faces)?;
    let mut faces = prepare_faces(raw, frame.size(), min_confidence, max_faces);
    let detect_time = started.elapsed();

    if !with_landmarks || faces.is_empty() {
        return Ok(DetectorPass {
            faces,
            landmarks_fresh: false,
            detect_time,
            landmark_time: None,
        });
    }

    let started = Instant::now();
    let landmarks_fresh = match detector.estimate_landmarks(frame) {
        Ok(meshes) => {
            attach_landmarks(&mut faces, meshes);
            true
        }
        Err(err) => {
            log::warn!("landmark estimation failed: {err:?}");
            false
        }
    };

    Ok(DetectorPass {
        faces,
        landmarks_fresh,
        detect_time,
        landmark_time: Some(started.elapsed()),
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("face model initialisation failed after {attempts} attempts: {last_error}")]
pub struct InitError {
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitState {
    /// The next attempt may start at `at`.
    Waiting { at: Instant },
    /// An attempt has started and its outcome is not known yet.
    Attempting,
    Ready,
    Failed,
}

/// Bounded model initialisation advanced once per tick, so backoff never holds up
/// the engine loop.
#[derive(Debug)]
pub struct InitRetry {
    policy: RetryPolicy,
    attempts: u32,
    state: InitState,
}

impl InitRetry {
    /// The first attempt is due immediately.
    pub fn new(policy: RetryPolicy, now: Instant) -> Self {
        Self {
            policy,
            attempts: 0,
            state: InitState::Waiting { at: now },
        }
    }

    /// Claim the next attempt if its backoff has elapsed.
    pub fn begin(&mut self, now: Instant) -> bool {
        match self.state {
            InitState::Waiting { at } if now >= at => {
                self.attempts += 1;
                self.state = InitState::Attempting;
                true
            }
            _ => false,
        }
    }

    /// Settle the attempt claimed by [`InitRetry::begin`]. Returns `None` while a
    /// retry is still scheduled, otherwise the attempt count or the final error.
    pub fn record(
        &mut self,
        outcome: Result<(), String>,
        now: Instant,
    ) -> Option<Result<u32, InitError>> {
        if self.state != InitState::Attempting {
            return None;
        }

        let attempts = self.attempts;
        let max_attempts = self.policy.max_retries + 1;
        match outcome {
            Ok(()) => {
                log::info!("face models ready (attempt {attempts}/{max_attempts})");
                self.state = InitState::Ready;
                Some(Ok(attempts))
            }
            Err(last_error) if attempts >= max_attempts => {
                log::error!("face model initialisation gave up after {attempts} attempts: {last_error}");
                self.state = InitState::Failed;
                Some(Err(InitError {
                    attempts,
                    last_error,
                }))
            }
            Err(err) => {
                log::warn!("face model initialisation failed (attempt {attempts}/{max_attempts}): {err}");
                self.state = InitState::Waiting {
                    at: now + self.policy.backoff,
                };
                None
            }
        }
    }

    /// Give up without further attempts.
    pub fn abandon(&mut self) {
        self.state = InitState::Failed;
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_ready(&self) -> bool {
        self.state == InitState::Ready
    }

    pub fn has_failed(&self) -> bool {
        self.state == InitState::Failed
    }
}

/// Run `detector.init()` on this thread if an attempt is due.
pub fn drive_init<D: FaceDetector + ?Sized>(
    retry: &mut InitRetry,
    detector: &mut D,
    now: Instant,
) -> Option<Result<u32, InitError>> {
    if !retry.begin(now) {
        return None;
    }
    let outcome = detector.init().map_err(|err| format!("{err:#}"));
    retry.record(outcome, now)
}
