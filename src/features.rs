//! Expression and head-orientation features derived from face-mesh geometry.
//!
//! Every primitive is a ratio of two distances measured on the same mesh, so the
//! values do not depend on how far the face is from the camera. Composite
//! expression scores are fixed linear blends of the primitives squashed into
//! `[0, 1]` and then renormalised into a distribution.

use crate::types::{FACE_MESH_POINTS, Landmark};

/// Semantic indices into the 468-point face mesh.
pub mod mesh {
    pub const NOSE_TIP: usize = 1;
    pub const FOREHEAD: usize = 10;
    pub const CHIN: usize = 152;
    pub const LEFT_EAR: usize = 234;
    pub const RIGHT_EAR: usize = 454;

    pub const MOUTH_TOP: usize = 13;
    pub const MOUTH_BOTTOM: usize = 14;
    pub const MOUTH_LEFT: usize = 78;
    pub const MOUTH_RIGHT: usize = 308;
    pub const MOUTH_LEFT_REF: usize = 92;
    pub const MOUTH_RIGHT_REF: usize = 322;

    pub const LEFT_EYE_TOP: usize = 159;
    pub const LEFT_EYE_BOTTOM: usize = 145;
    pub const LEFT_EYE_OUTER: usize = 33;
    pub const LEFT_EYE_INNER: usize = 133;
    pub const RIGHT_EYE_TOP: usize = 386;
    pub const RIGHT_EYE_BOTTOM: usize = 374;
    pub const RIGHT_EYE_OUTER: usize = 263;
    pub const RIGHT_EYE_INNER: usize = 362;

    pub const LEFT_BROW_OUTER: usize = 70;
    pub const RIGHT_BROW_OUTER: usize = 300;

    /// Upper/lower eyelid pairs, centre first.
    pub const LEFT_EYELID_PAIRS: [(usize, usize); 3] = [(159, 145), (158, 153), (160, 144)];
    pub const RIGHT_EYELID_PAIRS: [(usize, usize); 3] = [(386, 374), (385, 380), (387, 373)];
}

/// Fraction of the inter-ear distance that a fully open eyelid gap spans.
pub const REFINED_EYE_WIDTH_FRACTION: f32 = 0.06;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Expression {
    Neutral,
    Happy,
    Sad,
    Angry,
    Surprised,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExpressionScores {
    pub neutral: f32,
    pub happy: f32,
    pub sad: f32,
    pub angry: f32,
    pub surprised: f32,
}

impl ExpressionScores {
    pub fn neutral_only() -> Self {
        Self {
            neutral: 1.0,
            happy: 0.0,
            sad: 0.0,
            angry: 0.0,
            surprised: 0.0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Expression, f32)> {
        [
            (Expression::Neutral, self.neutral),
            (Expression::Happy, self.happy),
            (Expression::Sad, self.sad),
            (Expression::Angry, self.angry),
            (Expression::Surprised, self.surprised),
        ]
        .into_iter()
    }

    pub fn sum(&self) -> f32 {
        self.iter().map(|(_, score)| score).sum()
    }

    pub fn dominant(&self) -> (Expression, f32) {
        self.iter()
            .fold((Expression::Neutral, f32::MIN), |best, (kind, score)| {
                if score > best.1 { (kind, score) } else { best }
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeometricPrimitives {
    pub eye_openness: f32,
    pub mouth_openness: f32,
    pub mouth_width: f32,
    /// Positive when the mouth corners sit above their reference points.
    pub mouth_curvature: f32,
    pub eyebrow_raise: f32,
    /// Signed nose offset from the inter-ear midpoint; positive is a turn to the right.
    pub face_orientation: f32,
    pub refined_eye_openness: f32,
    pub left_eye_openness: f32,
    pub right_eye_openness: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaceFeatures {
    pub expressions: ExpressionScores,
    pub primitives: Option<GeometricPrimitives>,
}

impl FaceFeatures {
    pub fn neutral() -> Self {
        Self {
            expressions: ExpressionScores::neutral_only(),
            primitives: None,
        }
    }
}

pub fn extract_features(landmarks: &[Landmark]) -> FaceFeatures {
    if landmarks.len() < FACE_MESH_POINTS {
        return FaceFeatures::neutral();
    }

    let p = |idx: usize| landmarks[idx];
    let face_height = distance(p(mesh::FOREHEAD), p(mesh::CHIN));
    let face_width = distance(p(mesh::LEFT_EAR), p(mesh::RIGHT_EAR));

    let eye_openness = eye_aspect_openness(landmarks).unwrap_or(0.0);
    let mouth_openness = ratio(distance(p(mesh::MOUTH_TOP), p(mesh::MOUTH_BOTTOM)), face_height);
    let mouth_width = ratio(distance(p(mesh::MOUTH_LEFT), p(mesh::MOUTH_RIGHT)), face_width);
    let eyebrow_raise = (ratio(
        distance(p(mesh::LEFT_BROW_OUTER), p(mesh::LEFT_EYE_TOP)),
        face_height,
    ) + ratio(
        distance(p(mesh::RIGHT_BROW_OUTER), p(mesh::RIGHT_EYE_TOP)),
        face_height,
    )) / 2.0;
    let mouth_curvature = -(corner_lift(p(mesh::MOUTH_LEFT), p(mesh::MOUTH_LEFT_REF))
        + corner_lift(p(mesh::MOUTH_RIGHT), p(mesh::MOUTH_RIGHT_REF)))
        / 2.0;
    let face_orientation = face_orientation(landmarks).unwrap_or(0.0);

    let eye_scale = face_width * REFINED_EYE_WIDTH_FRACTION;
    let left_eye_openness = ratio(mean_lid_gap(landmarks, &mesh::LEFT_EYELID_PAIRS), eye_scale);
    let right_eye_openness = ratio(mean_lid_gap(landmarks, &mesh::RIGHT_EYELID_PAIRS), eye_scale);
    let refined_eye_openness = ((left_eye_openness + right_eye_openness) / 2.0).clamp(0.0, 1.0);

    let primitives = GeometricPrimitives {
        eye_openness,
        mouth_openness,
        mouth_width,
        mouth_curvature,
        eyebrow_raise,
        face_orientation,
        refined_eye_openness,
        left_eye_openness,
        right_eye_openness,
    };

    FaceFeatures {
        expressions: score_expressions(&primitives),
        primitives: Some(primitives),
    }
}

/// Lid separation over eye width, averaged over both eyes. Needs a full mesh.
pub fn eye_aspect_openness(landmarks: &[Landmark]) -> Option<f32> {
    if landmarks.len() < FACE_MESH_POINTS {
        return None;
    }

    let p = |idx: usize| landmarks[idx];
    let left = ratio(
        distance(p(mesh::LEFT_EYE_TOP), p(mesh::LEFT_EYE_BOTTOM)),
        distance(p(mesh::LEFT_EYE_OUTER), p(mesh::LEFT_EYE_INNER)),
    );
    let right = ratio(
        distance(p(mesh::RIGHT_EYE_TOP), p(mesh::RIGHT_EYE_BOTTOM)),
        distance(p(mesh::RIGHT_EYE_OUTER), p(mesh::RIGHT_EYE_INNER)),
    );

    Some((left + right) / 2.0)
}

/// Horizontal nose-tip offset from the inter-ear midpoint over the inter-ear span.
pub fn face_orientation(landmarks: &[Landmark]) -> Option<f32> {
    if landmarks.len() < FACE_MESH_POINTS {
        return None;
    }

    let nose = landmarks[mesh::NOSE_TIP];
    let left_ear = landmarks[mesh::LEFT_EAR];
    let right_ear = landmarks[mesh::RIGHT_EAR];
    let midpoint = (left_ear[0] + right_ear[0]) / 2.0;
    let span = (right_ear[0] - left_ear[0]).abs();

    Some(ratio(nose[0] - midpoint, span))
}

fn score_expressions(p: &GeometricPrimitives) -> ExpressionScores {
    let surprised = normalize(
        p.eye_openness * 3.0 + p.eyebrow_raise * 2.0 + p.mouth_openness * 2.0,
        0.1,
        0.5,
    );
    let happy = normalize(
        p.mouth_width * 3.0 + p.mouth_curvature * 6.0 + p.eyebrow_raise * 0.5
            - p.mouth_openness * 0.7,
        0.2,
        0.6,
    );
    let sad = normalize(
        (1.0 - p.mouth_width) * 1.5 + (1.0 - p.eyebrow_raise) * 2.0 - p.mouth_curvature * 4.0,
        0.0,
        0.4,
    );
    let angry = normalize(
        (1.0 - p.eyebrow_raise) * 4.0 + (1.0 - p.eye_openness) * 2.0 - p.mouth_curvature * 2.0,
        0.0,
        0.5,
    );
    let neutral = (1.0 - (surprised + happy + sad + angry)).max(0.0);

    // Either neutral fills the gap up to 1 or the others already exceed it.
    let sum = neutral + happy + sad + angry + surprised;
    ExpressionScores {
        neutral: neutral / sum,
        happy: happy / sum,
        sad: sad / sum,
        angry: angry / sum,
        surprised: surprised / sum,
    }
}

fn mean_lid_gap(landmarks: &[Landmark], pairs: &[(usize, usize)]) -> f32 {
    let total: f32 = pairs
        .iter()
        .map(|&(upper, lower)| distance(landmarks[upper], landmarks[lower]))
        .sum();
    total / pairs.len() as f32
}

/// Sine of the corner's elevation relative to its reference point; negative when
/// the corner sits higher in the image.
fn corner_lift(corner: Landmark, reference: Landmark) -> f32 {
    ratio(corner[1] - reference[1], distance(corner, reference))
}

fn ratio(numerator: f32, denominator: f32) -> f32 {
    if denominator > f32::EPSILON && numerator.is_finite() {
        numerator / denominator
    } else {
        0.0
    }
}

fn normalize(value: f32, min: f32, max: f32) -> f32 {
    let normalized = (value - min) / (max - min);
    if normalized.is_nan() {
        0.0
    } else {
        normalized.clamp(0.0, 1.0)
    }
}

pub(crate) fn distance(a: Landmark, b: Landmark) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}
