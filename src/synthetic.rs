//! Procedural face mesh and a detector that serves it.
//!
//! Only the mesh points the feature extractor reads are placed; every other point
//! sits at the face centre. Geometry is parameterised so that the extracted
//! primitives map back onto the pose: `refined_eye_openness == eye_openness` and
//! `face_orientation == yaw`.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    features::{REFINED_EYE_WIDTH_FRACTION, mesh},
    liveness::LivenessStep,
    pipeline::{FaceDetector, RawFace},
    types::{FACE_MESH_POINTS, FaceBox, Frame, Landmark},
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FacePose {
    pub center: (f32, f32),
    /// Ear-to-ear distance in pixels.
    pub face_width: f32,
    pub eye_openness: f32,
    pub yaw: f32,
    pub smile: f32,
    pub mouth_open: f32,
}

impl Default for FacePose {
    fn default() -> Self {
        Self {
            center: (320.0, 240.0),
            face_width: 260.0,
            eye_openness: 1.0,
            yaw: 0.0,
            smile: 0.0,
            mouth_open: 0.0,
        }
    }
}

pub fn face_box(pose: &FacePose) -> FaceBox {
    let (cx, cy) = pose.center;
    let s = pose.face_width;
    FaceBox::from_corners(cx - s * 0.5, cy - s * 0.6, cx + s * 0.5, cy + s * 0.6)
}

pub fn face_mesh(pose: &FacePose) -> Vec<Landmark> {
    let (cx, cy) = pose.center;
    let s = pose.face_width;
    let mut points = vec![[cx, cy, 0.0]; FACE_MESH_POINTS];

    put(&mut points, mesh::LEFT_EAR, cx - s * 0.5, cy);
    put(&mut points, mesh::RIGHT_EAR, cx + s * 0.5, cy);
    put(&mut points, mesh::FOREHEAD, cx, cy - s * 0.6);
    put(&mut points, mesh::CHIN, cx, cy + s * 0.6);
    put(&mut points, mesh::NOSE_TIP, cx + pose.yaw * s, cy + s * 0.05);
    put(&mut points, 2, cx + pose.yaw * s, cy + s * 0.1);

    let eye_y = cy - s * 0.15;
    let gap = pose.eye_openness * s * REFINED_EYE_WIDTH_FRACTION;
    let lid_offsets = [0.0, -0.03 * s, 0.03 * s];
    for (eye_x, pairs, outer, inner, brow, outward) in [
        (
            cx - s * 0.2,
            mesh::LEFT_EYELID_PAIRS,
            mesh::LEFT_EYE_OUTER,
            mesh::LEFT_EYE_INNER,
            mesh::LEFT_BROW_OUTER,
            -1.0,
        ),
        (
            cx + s * 0.2,
            mesh::RIGHT_EYELID_PAIRS,
            mesh::RIGHT_EYE_OUTER,
            mesh::RIGHT_EYE_INNER,
            mesh::RIGHT_BROW_OUTER,
            1.0,
        ),
    ] {
        put(&mut points, outer, eye_x + outward * s * 0.1, eye_y);
        put(&mut points, inner, eye_x - outward * s * 0.1, eye_y);
        put(&mut points, brow, eye_x + outward * s * 0.08, eye_y - s * 0.1);
        for ((upper, lower), dx) in pairs.into_iter().zip(lid_offsets) {
            put(&mut points, upper, eye_x + dx, eye_y - gap * 0.5);
            put(&mut points, lower, eye_x + dx, eye_y + gap * 0.5);
        }
    }

    let mouth_y = cy + s * 0.3;
    let half_width = (0.35 + 0.1 * pose.smile) * s * 0.5;
    let lift = pose.smile * s * 0.06;
    let opening = pose.mouth_open * s * 0.1;
    put(&mut points, mesh::MOUTH_LEFT, cx - half_width, mouth_y - lift);
    put(&mut points, mesh::MOUTH_RIGHT, cx + half_width, mouth_y - lift);
    put(&mut points, mesh::MOUTH_LEFT_REF, cx - half_width + s * 0.04, mouth_y);
    put(&mut points, mesh::MOUTH_RIGHT_REF, cx + half_width - s * 0.04, mouth_y);
    put(&mut points, mesh::MOUTH_TOP, cx, mouth_y - opening * 0.5);
    put(&mut points, mesh::MOUTH_BOTTOM, cx, mouth_y + opening * 0.5);

    points
}

fn put(points: &mut [Landmark], idx: usize, x: f32, y: f32) {
    points[idx] = [x, y, 0.0];
}

/// Pose shared between whoever plays the user and the detector; `None` means no
/// face is in view.
pub type SharedPose = Arc<Mutex<Option<FacePose>>>;

/// Detector that reports whatever pose is currently shared, as a perfect face
/// detector plus face-mesh model would.
pub struct SimulatedDetector {
    pose: SharedPose,
    init_failures: u32,
    fail_detection: bool,
}

impl SimulatedDetector {
    pub fn new(pose: SharedPose) -> Self {
        Self {
            pose,
            init_failures: 0,
            fail_detection: false,
        }
    }

    /// Fail the first `count` calls to `init`.
    pub fn with_init_failures(mut self, count: u32) -> Self {
        self.init_failures = count;
        self
    }

    pub fn with_failing_detection(mut self) -> Self {
        self.fail_detection = true;
        self
    }

    fn current_pose(&self) -> Option<FacePose> {
        *self.pose.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FaceDetector for SimulatedDetector {
    fn init(&mut self) -> anyhow::Result<()> {
        if self.init_failures > 0 {
            self.init_failures -= 1;
            anyhow::bail!("simulated model download failure");
        }
        Ok(())
    }

    fn detect(
        &mut self,
        _frame: &Frame,
        min_confidence: f32,
        max_faces: usize,
    ) -> anyhow::Result<Vec<RawFace>> {
        if self.fail_detection {
            anyhow::bail!("simulated detector fault");
        }

        Ok(self
            .current_pose()
            .map(|pose| RawFace {
                bbox: face_box(&pose),
                probability: 0.98,
                landmarks: None,
            })
            .into_iter()
            .filter(|face| face.probability >= min_confidence)
            .take(max_faces)
            .collect())
    }

    fn estimate_landmarks(&mut self, _frame: &Frame) -> anyhow::Result<Vec<Vec<Landmark>>> {
        Ok(self.current_pose().map(|pose| face_mesh(&pose)).into_iter().collect())
    }
}

const BLINK_CYCLE: Duration = Duration::from_millis(1200);
/// Eyes stay shut for this long at the start of every cycle.
const BLINK_CLOSED: Duration = Duration::from_millis(500);

/// How a cooperative user would hold their face during `step`, `elapsed` into it.
pub fn scripted_pose(step: LivenessStep, elapsed: Duration) -> FacePose {
    let neutral = FacePose::default();
    match step {
        LivenessStep::BlinkEyes => {
            let phase = elapsed.as_millis() % BLINK_CYCLE.as_millis();
            FacePose {
                eye_openness: if phase < BLINK_CLOSED.as_millis() { 0.05 } else { 1.0 },
                ..neutral
            }
        }
        LivenessStep::TurnLeft => FacePose {
            yaw: -0.25,
            ..neutral
        },
        LivenessStep::TurnRight => FacePose { yaw: 0.25, ..neutral },
        LivenessStep::Smile => FacePose {
            smile: 1.0,
            ..neutral
        },
        LivenessStep::Intro | LivenessStep::FaceAlignment | LivenessStep::Completed => neutral,
    }
}
