//! Challenge-response face liveness verification.
//!
//! Frames go through a [`pipeline::FaceDetector`], the resulting face meshes are
//! turned into geometric features, and a [`liveness::LivenessSession`] scores them
//! against the current challenge step.

pub mod config;
pub mod features;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod synthetic;
pub mod types;
