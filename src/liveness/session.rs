use std::time::{Duration, Instant};

use crate::types::{Detection, FrameSize};

use super::{
    DetectionHistory, LivenessAction, LivenessError, LivenessStep,
    classifier::{StepOutcome, classify_step},
};

const STEP_COUNT: usize = LivenessStep::ALL.len();
/// Overall progress stays below this until the final step has been advanced past.
const OVERALL_PROGRESS_CEILING: f32 = 99.0;

/// State of one liveness check. Owned by a single writer; detections are fed in
/// through [`LivenessSession::process_detections`] and the caller decides when to
/// [`advance`](LivenessSession::advance).
#[derive(Clone, Debug)]
pub struct LivenessSession {
    current_step: LivenessStep,
    progress: f32,
    step_completed: [bool; STEP_COUNT],
    step_started_at: Option<Instant>,
    step_timeout: Duration,
    history: DetectionHistory,
    full_progress_at: Option<Instant>,
}

impl LivenessSession {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            current_step: LivenessStep::Intro,
            progress: 0.0,
            step_completed: [false; STEP_COUNT],
            step_started_at: None,
            step_timeout,
            history: DetectionHistory::default(),
            full_progress_at: None,
        }
    }

    pub fn start(&mut self, now: Instant) -> Result<(), LivenessError> {
        if self.current_step != LivenessStep::Intro {
            return Err(LivenessError::AlreadyStarted(self.current_step));
        }

        self.step_completed[LivenessStep::Intro.index()] = true;
        self.history = DetectionHistory::default();
        self.enter(LivenessStep::FaceAlignment, now);
        Ok(())
    }

    /// Complete the current step and move to the next one. No-op once completed.
    pub fn advance(&mut self, now: Instant) {
        if self.current_step == LivenessStep::Completed {
            return;
        }

        self.step_completed[self.current_step.index()] = true;
        self.enter(self.current_step.next(), now);
    }

    pub fn reset(&mut self) {
        log::debug!("liveness check reset from {:?}", self.current_step);
        *self = Self::new(self.step_timeout);
    }

    fn enter(&mut self, step: LivenessStep, now: Instant) {
        log::debug!("liveness step {:?} -> {:?}", self.current_step, step);
        self.current_step = step;
        self.progress = 0.0;
        self.full_progress_at = None;
        self.step_started_at = step.is_challenge().then_some(now);
    }

    /// Clamp into `[0, 100]`. Full progress is sticky until the step changes.
    pub fn apply_progress(&mut self, progress: f32) {
        if progress.is_nan() || self.progress >= 100.0 {
            return;
        }
        self.progress = progress.clamp(0.0, 100.0);
    }

    pub fn mark_action(&mut self, action: LivenessAction) {
        self.history.mark(action);
    }

    /// Soft retry: once the step has run longer than the timeout, progress drops
    /// back to zero. The step and its start time are kept.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        let Some(started) = self.step_started_at else {
            return false;
        };
        if now.saturating_duration_since(started) <= self.step_timeout {
            return false;
        }

        if self.progress > 0.0 && self.progress < 100.0 {
            log::debug!("{:?} timed out, progress reset", self.current_step);
        }
        self.apply_progress(0.0);
        true
    }

    /// Score the first detection against the current step and apply the result.
    pub fn process_detections(
        &mut self,
        detections: &[Detection],
        frame: FrameSize,
        now: Instant,
    ) -> Option<StepOutcome> {
        if !self.current_step.is_challenge() {
            return None;
        }
        let detection = detections.first()?;

        let outcome = classify_step(
            self.current_step,
            detection,
            frame,
            &mut self.history,
            self.progress,
        );
        if let Some(outcome) = outcome {
            if let Some(action) = outcome.action {
                self.mark_action(action);
            }
            self.apply_progress(outcome.progress);
            if self.progress >= 100.0 && self.full_progress_at.is_none() {
                self.full_progress_at = Some(now);
            }
        }

        self.check_timeout(now);
        outcome
    }

    pub fn ready_to_advance(&self) -> bool {
        self.current_step.is_challenge() && self.progress >= 100.0
    }

    /// True once full progress has been shown for at least `delay`.
    pub fn advance_due(&self, now: Instant, delay: Duration) -> bool {
        self.ready_to_advance()
            && self
                .full_progress_at
                .is_some_and(|reached| now.saturating_duration_since(reached) >= delay)
    }

    /// Progress across the whole check, 0 to 100.
    pub fn overall_progress(&self) -> f32 {
        match self.current_step {
            LivenessStep::Intro => 0.0,
            LivenessStep::Completed => 100.0,
            _ => {
                let steps = LivenessStep::CHALLENGES.len() as f32;
                let done = LivenessStep::CHALLENGES
                    .iter()
                    .filter(|step| self.step_completed[step.index()])
                    .count() as f32;
                (done / steps * 100.0 + self.progress / steps).min(OVERALL_PROGRESS_CEILING)
            }
        }
    }

    pub fn current_step(&self) -> LivenessStep {
        self.current_step
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn step_completed(&self) -> [bool; STEP_COUNT] {
        self.step_completed
    }

    pub fn is_step_completed(&self, step: LivenessStep) -> bool {
        self.step_completed[step.index()]
    }

    pub fn step_started_at(&self) -> Option<Instant> {
        self.step_started_at
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    pub fn history(&self) -> &DetectionHistory {
        &self.history
    }
}
