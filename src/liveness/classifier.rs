//! Per-step gesture classifiers: detection geometry in, step progress out.

use crate::{
    features::{self, GeometricPrimitives},
    types::{Detection, FrameSize, Landmark},
};

use super::{DetectionHistory, LivenessAction, LivenessStep};

/// Previous openness above which a large drop counts as a blink.
pub const BLINK_OPEN_THRESHOLD: f32 = 0.5;
pub const BLINK_CHANGE_THRESHOLD: f32 = 0.25;
/// Openness below which a still-closing eye counts as a blink.
pub const BLINK_CLOSED_THRESHOLD: f32 = 0.3;
pub const TURN_THRESHOLD: f32 = 0.15;
pub const SMILE_THRESHOLD: f32 = 0.4;
/// Fallback smile threshold on the `happy` expression score.
pub const HAPPY_THRESHOLD: f32 = 0.6;

const BLINK_PARTIAL_CAP: f32 = 90.0;

/// Eye aspect ratio of a fully open eye; maps mesh-only openness onto the refined
/// scale, where an open eye reads 1.0.
pub const OPEN_EYE_ASPECT_RATIO: f32 = 0.3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepOutcome {
    /// Unclamped; the session clamps into `[0, 100]`.
    pub progress: f32,
    pub action: Option<LivenessAction>,
}

impl StepOutcome {
    fn partial(progress: f32) -> Self {
        Self {
            progress,
            action: None,
        }
    }

    fn detected(action: LivenessAction) -> Self {
        Self {
            progress: 100.0,
            action: Some(action),
        }
    }
}

/// Score `detection` against `step`. `None` means the frame carried nothing the
/// step can measure and progress stays where it is.
pub fn classify_step(
    step: LivenessStep,
    detection: &Detection,
    frame: FrameSize,
    history: &mut DetectionHistory,
    current_progress: f32,
) -> Option<StepOutcome> {
    match step {
        LivenessStep::FaceAlignment => classify_alignment(detection, frame),
        LivenessStep::BlinkEyes => classify_blink(detection, history, current_progress),
        LivenessStep::TurnLeft => classify_turn(detection, history, TurnDirection::Left),
        LivenessStep::TurnRight => classify_turn(detection, history, TurnDirection::Right),
        LivenessStep::Smile => classify_smile(detection),
        LivenessStep::Intro | LivenessStep::Completed => None,
    }
}

fn classify_alignment(detection: &Detection, frame: FrameSize) -> Option<StepOutcome> {
    if frame.is_empty() {
        return None;
    }

    let bbox = &detection.bbox;
    let (center_x, center_y) = bbox.center();
    let norm_x = center_x / frame.width;
    let norm_y = center_y / frame.height;
    let norm_width = bbox.width / frame.width;
    let norm_height = bbox.height / frame.height;

    let centered = in_open_range(norm_x, 0.25, 0.75)
        && in_open_range(norm_y, 0.25, 0.75)
        && in_open_range(norm_width, 0.2, 0.8)
        && in_open_range(norm_height, 0.2, 0.8);
    if centered {
        return Some(StepOutcome::partial(100.0));
    }

    let dist = ((norm_x - 0.5).powi(2) + (norm_y - 0.5).powi(2)).sqrt();
    let size_optimal = ((norm_width - 0.1) / 0.3)
        .max(0.0)
        .min(((0.9 - norm_width) / 0.3).max(0.0));
    let progress = (70.0 * (1.0 - 2.0 * dist) + 30.0 * size_optimal).max(0.0);

    Some(StepOutcome::partial(progress))
}

fn in_open_range(value: f32, low: f32, high: f32) -> bool {
    value > low && value < high
}

fn classify_blink(
    detection: &Detection,
    history: &mut DetectionHistory,
    current_progress: f32,
) -> Option<StepOutcome> {
    let current = primitives(detection)
        .map(|p| p.refined_eye_openness)
        .or_else(|| detection.landmarks.as_deref().and_then(mesh_eye_openness))?;
    let prev = history.prev_eye_openness;
    history.prev_eye_openness = current;

    let sharp_drop = prev > BLINK_OPEN_THRESHOLD && prev - current > BLINK_CHANGE_THRESHOLD;
    let closing = current < BLINK_CLOSED_THRESHOLD && current < prev;
    if sharp_drop || closing {
        log::debug!("blink detected: openness {prev:.2} -> {current:.2}");
        return Some(StepOutcome::detected(LivenessAction::Blink));
    }

    if history.blink_detected {
        return None;
    }

    let partial = ((current - prev).abs() * 200.0)
        .max((1.0 - current) * 70.0)
        .min(BLINK_PARTIAL_CAP);
    (partial > current_progress).then(|| StepOutcome::partial(partial))
}

fn mesh_eye_openness(landmarks: &[Landmark]) -> Option<f32> {
    features::eye_aspect_openness(landmarks)
        .map(|ratio| (ratio / OPEN_EYE_ASPECT_RATIO).clamp(0.0, 1.0))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TurnDirection {
    Left,
    Right,
}

fn classify_turn(
    detection: &Detection,
    history: &mut DetectionHistory,
    direction: TurnDirection,
) -> Option<StepOutcome> {
    let orientation = primitives(detection)
        .map(|p| p.face_orientation)
        .or_else(|| detection.landmarks.as_deref().and_then(features::face_orientation))?;
    history.prev_face_orientation = orientation;

    // Positive orientation is a turn to the right.
    let (signed, action) = match direction {
        TurnDirection::Left => (-orientation, LivenessAction::LeftTurn),
        TurnDirection::Right => (orientation, LivenessAction::RightTurn),
    };

    if signed > TURN_THRESHOLD {
        log::debug!("{action:?} detected: orientation {orientation:.3}");
        return Some(StepOutcome::detected(action));
    }

    Some(StepOutcome::partial(
        (signed / TURN_THRESHOLD * 100.0).clamp(0.0, 100.0),
    ))
}

fn classify_smile(detection: &Detection) -> Option<StepOutcome> {
    let features = detection.features.as_ref()?;

    if let Some(p) = features.primitives.as_ref() {
        let score = p.mouth_curvature * 0.7 + p.mouth_width * 0.3;
        if score > SMILE_THRESHOLD {
            log::debug!("smile detected: score {score:.3}");
            return Some(StepOutcome::detected(LivenessAction::Smile));
        }
        return Some(StepOutcome::partial(score * 150.0));
    }

    let happy = features.expressions.happy;
    if happy <= 0.0 {
        return None;
    }
    if happy > HAPPY_THRESHOLD {
        log::debug!("smile detected from expression score {happy:.3}");
        return Some(StepOutcome::detected(LivenessAction::Smile));
    }
    Some(StepOutcome::partial(happy * 120.0))
}

fn primitives(detection: &Detection) -> Option<&GeometricPrimitives> {
    detection.features.as_ref()?.primitives.as_ref()
}
