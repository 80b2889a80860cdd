use std::{sync::Arc, time::Instant};

use uuid::Uuid;

use crate::features::FaceFeatures;

/// One face-mesh point in frame pixel coordinates; `z` is the model's relative depth.
pub type Landmark = [f32; 3];

/// Number of points in a full face mesh. Shorter landmark sets carry no usable
/// expression geometry.
pub const FACE_MESH_POINTS: usize = 468;

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn blank(width: u32, height: u32, timestamp: Instant) -> Self {
        Self {
            rgba: vec![0; width as usize * height as usize * 4],
            width,
            height,
            timestamp,
        }
    }

    pub fn size(&self) -> FrameSize {
        FrameSize {
            width: self.width as f32,
            height: self.height as f32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameSize {
    pub width: f32,
    pub height: f32,
}

impl FrameSize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaceBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub fn from_corners(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
            width: (x_max - x_min).max(0.0),
            height: (y_max - y_min).max(0.0),
        }
    }

    /// Smallest box containing every point, ignoring depth.
    pub fn enclosing(points: &[Landmark]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }

        let (min_x, max_x, min_y, max_y) = points
            .iter()
            .fold((f32::MAX, f32::MIN, f32::MAX, f32::MIN), |acc, [x, y, _]| {
                (acc.0.min(*x), acc.1.max(*x), acc.2.min(*y), acc.3.max(*y))
            });

        let bbox = Self::from_corners(min_x, min_y, max_x, max_y);
        bbox.is_finite().then_some(bbox)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.x_min + self.x_max) * 0.5,
            (self.y_min + self.y_max) * 0.5,
        )
    }

    pub fn is_finite(&self) -> bool {
        self.x_min.is_finite()
            && self.y_min.is_finite()
            && self.x_max.is_finite()
            && self.y_max.is_finite()
    }

    pub fn clamp_to(&self, frame: FrameSize) -> Self {
        Self::from_corners(
            self.x_min.max(0.0),
            self.y_min.max(0.0),
            self.x_max.min(frame.width),
            self.y_max.min(frame.height),
        )
    }

    /// Grow the box by `factor` of its size (split evenly on both sides), staying
    /// inside the frame.
    pub fn expand(&self, factor: f32, frame: FrameSize) -> Self {
        let dx = self.width * factor * 0.5;
        let dy = self.height * factor * 0.5;
        Self::from_corners(self.x_min - dx, self.y_min - dy, self.x_max + dx, self.y_max + dy)
            .clamp_to(frame)
    }
}

#[derive(Clone, Debug)]
pub struct Detection {
    pub id: Uuid,
    pub bbox: FaceBox,
    pub confidence: f32,
    pub landmarks: Option<Arc<[Landmark]>>,
    pub features: Option<FaceFeatures>,
}

impl Detection {
    pub fn new(bbox: FaceBox, confidence: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            bbox,
            confidence,
            landmarks: None,
            features: None,
        }
    }

    pub fn with_landmarks(mut self, landmarks: impl Into<Arc<[Landmark]>>) -> Self {
        self.landmarks = Some(landmarks.into());
        self
    }

    pub fn with_features(mut self, features: FaceFeatures) -> Self {
        self.features = Some(features);
        self
    }

    pub fn has_full_mesh(&self) -> bool {
        self.landmarks
            .as_ref()
            .is_some_and(|points| points.len() >= FACE_MESH_POINTS)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PerformanceMetrics {
    pub fps: f32,
    pub detect_time_ms: f32,
    pub landmark_time_ms: f32,
}
