mod classifier;
mod session;

pub use classifier::{
    BLINK_CHANGE_THRESHOLD, BLINK_CLOSED_THRESHOLD, BLINK_OPEN_THRESHOLD, HAPPY_THRESHOLD,
    SMILE_THRESHOLD, StepOutcome, TURN_THRESHOLD, classify_step,
};
pub use session::LivenessSession;

use thiserror::Error;

/// Steps of a liveness check, in the only order they can be visited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LivenessStep {
    Intro,
    FaceAlignment,
    BlinkEyes,
    TurnLeft,
    TurnRight,
    Smile,
    Completed,
}

impl LivenessStep {
    pub const ALL: [LivenessStep; 7] = [
        LivenessStep::Intro,
        LivenessStep::FaceAlignment,
        LivenessStep::BlinkEyes,
        LivenessStep::TurnLeft,
        LivenessStep::TurnRight,
        LivenessStep::Smile,
        LivenessStep::Completed,
    ];

    pub const CHALLENGES: [LivenessStep; 5] = [
        LivenessStep::FaceAlignment,
        LivenessStep::BlinkEyes,
        LivenessStep::TurnLeft,
        LivenessStep::TurnRight,
        LivenessStep::Smile,
    ];

    /// Following step; `Completed` is terminal.
    pub fn next(self) -> LivenessStep {
        match self {
            LivenessStep::Intro => LivenessStep::FaceAlignment,
            LivenessStep::FaceAlignment => LivenessStep::BlinkEyes,
            LivenessStep::BlinkEyes => LivenessStep::TurnLeft,
            LivenessStep::TurnLeft => LivenessStep::TurnRight,
            LivenessStep::TurnRight => LivenessStep::Smile,
            LivenessStep::Smile | LivenessStep::Completed => LivenessStep::Completed,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_challenge(self) -> bool {
        !matches!(self, LivenessStep::Intro | LivenessStep::Completed)
    }

    pub fn label(self) -> &'static str {
        match self {
            LivenessStep::Intro => "Introduction",
            LivenessStep::FaceAlignment => "Face Alignment",
            LivenessStep::BlinkEyes => "Blink Detection",
            LivenessStep::TurnLeft => "Turn Left",
            LivenessStep::TurnRight => "Turn Right",
            LivenessStep::Smile => "Smile Detection",
            LivenessStep::Completed => "Verification Complete",
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            LivenessStep::Intro => "We'll verify that you're a real person with a few simple steps",
            LivenessStep::FaceAlignment => "Position your face within the frame",
            LivenessStep::BlinkEyes => "Please blink your eyes a few times",
            LivenessStep::TurnLeft => "Slowly turn your head to the left",
            LivenessStep::TurnRight => "Slowly turn your head to the right",
            LivenessStep::Smile => "Please smile naturally",
            LivenessStep::Completed => "Liveness verification completed successfully",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessAction {
    Blink,
    LeftTurn,
    RightTurn,
    Smile,
}

/// Gestures seen so far in the current check, plus the previous frame's
/// measurements the blink and turn classifiers compare against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionHistory {
    pub blink_detected: bool,
    pub left_turn_detected: bool,
    pub right_turn_detected: bool,
    pub smile_detected: bool,
    pub prev_eye_openness: f32,
    pub prev_face_orientation: f32,
}

impl Default for DetectionHistory {
    fn default() -> Self {
        Self {
            blink_detected: false,
            left_turn_detected: false,
            right_turn_detected: false,
            smile_detected: false,
            prev_eye_openness: 1.0,
            prev_face_orientation: 0.0,
        }
    }
}

impl DetectionHistory {
    pub fn is_detected(&self, action: LivenessAction) -> bool {
        match action {
            LivenessAction::Blink => self.blink_detected,
            LivenessAction::LeftTurn => self.left_turn_detected,
            LivenessAction::RightTurn => self.right_turn_detected,
            LivenessAction::Smile => self.smile_detected,
        }
    }

    pub fn mark(&mut self, action: LivenessAction) {
        match action {
            LivenessAction::Blink => self.blink_detected = true,
            LivenessAction::LeftTurn => self.left_turn_detected = true,
            LivenessAction::RightTurn => self.right_turn_detected = true,
            LivenessAction::Smile => self.smile_detected = true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LivenessError {
    #[error("liveness check already started (current step: {0:?})")]
    AlreadyStarted(LivenessStep),
}
