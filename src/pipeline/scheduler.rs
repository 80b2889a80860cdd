use std::time::{Duration, Instant};

use crate::{
    config::{EngineConfig, ModelSettings, PerformanceConfig},
    features::extract_features,
    matcher::{CARRY_FORWARD_IOU, best_match},
    types::{Detection, Frame, FrameSize, PerformanceMetrics},
};

use super::{
    budget::{FrameBudget, SkipReason},
    detector::{DetectorPass, FaceDetector, RawFace, run_detector_pass},
};

/// Detections produced from one frame.
#[derive(Clone, Debug)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
    pub frame_size: FrameSize,
}

#[derive(Clone, Debug)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Processed(DetectionBatch),
}

/// Frame-to-frame continuity: throttles the landmark and feature stages and fills
/// their gaps from the previous frame's best-overlapping detection.
#[derive(Debug, Default)]
pub struct DetectionTracker {
    previous: Vec<Detection>,
    last_landmark_run: Option<Instant>,
    last_expression_run: Option<Instant>,
}

impl DetectionTracker {
    pub fn landmarks_due(&self, now: Instant, throttle: Duration) -> bool {
        elapsed_at_least(self.last_landmark_run, now, throttle)
    }

    pub fn note_landmark_run(&mut self, now: Instant) {
        self.last_landmark_run = Some(now);
    }

    /// Turn detector output into published detections and remember them for the
    /// next frame.
    pub fn finalize(
        &mut self,
        faces: Vec<RawFace>,
        landmarks_fresh: bool,
        now: Instant,
        settings: &ModelSettings,
        performance: &PerformanceConfig,
    ) -> Vec<Detection> {
        let features_due = settings.expressions_enabled
            && elapsed_at_least(self.last_expression_run, now, performance.expression_throttle);
        let previous = &self.previous;
        let mut extracted = false;

        let detections: Vec<Detection> = faces
            .into_iter()
            .map(|face| {
                let mut detection = Detection::from(face);

                if settings.landmarks_enabled && !landmarks_fresh && detection.landmarks.is_none() {
                    detection.landmarks = best_match(
                        &detection.bbox,
                        previous
                            .iter()
                            .filter_map(|prev| Some((prev.bbox, prev.landmarks.clone()?))),
                        CARRY_FORWARD_IOU,
                    )
                    .map(|(landmarks, _)| landmarks);
                }

                if features_due {
                    if let Some(landmarks) = detection.landmarks.as_deref() {
                        detection.features = Some(extract_features(landmarks));
                        extracted = true;
                    }
                }

                if settings.expressions_enabled && detection.features.is_none() {
                    detection.features = best_match(
                        &detection.bbox,
                        previous
                            .iter()
                            .filter_map(|prev| Some((prev.bbox, prev.features?))),
                        CARRY_FORWARD_IOU,
                    )
                    .map(|(features, _)| features);
                }

                detection
            })
            .collect();

        if extracted {
            self.last_expression_run = Some(now);
        }
        self.previous = detections.clone();
        detections
    }
}

fn elapsed_at_least(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
    last.is_none_or(|last| now.saturating_duration_since(last) >= interval)
}

/// Runs detection inline on the tick that owns it.
pub struct FrameScheduler<D: FaceDetector> {
    detector: D,
    settings: ModelSettings,
    performance: PerformanceConfig,
    budget: FrameBudget,
    tracker: DetectionTracker,
    metrics: PerformanceMetrics,
}

impl<D: FaceDetector> FrameScheduler<D> {
    pub fn new(detector: D, config: &EngineConfig) -> Self {
        Self {
            detector,
            settings: config.model.clone(),
            performance: config.performance.clone(),
            budget: FrameBudget::new(config.frame_interval(), config.performance.max_skip_frames),
            tracker: DetectionTracker::default(),
            metrics: PerformanceMetrics::default(),
        }
    }

    pub fn detector_mut(&mut self) -> &mut D {
        &mut self.detector
    }

    /// Update the frame rate. Called on every engine tick, with or without a frame.
    pub fn record_tick(&mut self, now: Instant) {
        self.metrics.fps = self.budget.record_tick(now);
    }

    pub fn tick(&mut self, frame: &Frame, now: Instant) -> TickOutcome {
        if let Err(reason) = self.budget.try_begin() {
            return TickOutcome::Skipped(reason);
        }

        let with_landmarks = self.settings.landmarks_enabled
            && self
                .tracker
                .landmarks_due(now, self.performance.landmark_throttle);

        let started = Instant::now();
        let pass = match run_detector_pass(
            &mut self.detector,
            frame,
            self.settings.detection_confidence,
            self.settings.max_faces,
            with_landmarks,
        ) {
            Ok(pass) => pass,
            Err(err) => {
                log::warn!("face detection failed: {err:?}");
                DetectorPass {
                    faces: Vec::new(),
                    landmarks_fresh: false,
                    detect_time: started.elapsed(),
                    landmark_time: None,
                }
            }
        };

        if pass.landmark_time.is_some() {
            self.tracker.note_landmark_run(now);
        }
        self.metrics.detect_time_ms = millis(pass.detect_time);
        self.metrics.landmark_time_ms = pass.landmark_time.map_or(0.0, millis);

        let detections = self.tracker.finalize(
            pass.faces,
            pass.landmarks_fresh,
            now,
            &self.settings,
            &self.performance,
        );
        self.budget.finish(pass.detect_time);

        TickOutcome::Processed(DetectionBatch {
            detections,
            frame_size: frame.size(),
        })
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics
    }

    pub fn tracker(&self) -> &DetectionTracker {
        &self.tracker
    }
}

pub(crate) fn millis(duration: Duration) -> f32 {
    duration.as_secs_f32() * 1000.0
}
