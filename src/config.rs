use std::{str::FromStr, time::Duration};

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("throttling level must be 1, 2 or 3 (got {0})")]
    InvalidThrottlingLevel(u8),
    #[error("detection confidence must be within [0, 1] (got {0})")]
    InvalidConfidence(f32),
    #[error("max faces must be at least 1")]
    InvalidMaxFaces,
    #[error("target fps must be positive (got {0})")]
    InvalidTargetFps(u32),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// What the face models are asked to produce.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSettings {
    /// Detector predictions below this probability are dropped.
    pub detection_confidence: f32,
    pub max_faces: usize,
    pub landmarks_enabled: bool,
    pub expressions_enabled: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            detection_confidence: 0.5,
            max_faces: 1,
            landmarks_enabled: true,
            expressions_enabled: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ThrottlingLevel {
    Responsive = 1,
    #[default]
    Balanced = 2,
    PowerSaver = 3,
}

impl TryFrom<u8> for ThrottlingLevel {
    type Error = ConfigError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(ThrottlingLevel::Responsive),
            2 => Ok(ThrottlingLevel::Balanced),
            3 => Ok(ThrottlingLevel::PowerSaver),
            other => Err(ConfigError::InvalidThrottlingLevel(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PerformanceConfig {
    pub throttling_level: ThrottlingLevel,
    /// Minimum time between landmark-model runs.
    pub landmark_throttle: Duration,
    /// Minimum time between feature extractions.
    pub expression_throttle: Duration,
    pub max_skip_frames: u32,
    /// Run detection on a dedicated worker thread instead of inside the tick.
    pub use_alternate_execution_context: bool,
}

impl PerformanceConfig {
    pub fn from_level(level: ThrottlingLevel) -> Self {
        let (landmark_ms, expression_ms, max_skip_frames) = match level {
            ThrottlingLevel::Responsive => (100, 200, 1),
            ThrottlingLevel::Balanced => (200, 400, 2),
            ThrottlingLevel::PowerSaver => (300, 600, 3),
        };

        Self {
            throttling_level: level,
            landmark_throttle: Duration::from_millis(landmark_ms),
            expression_throttle: Duration::from_millis(expression_ms),
            max_skip_frames,
            use_alternate_execution_context: false,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self::from_level(ThrottlingLevel::default())
    }
}

/// Model initialisation retries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub model: ModelSettings,
    pub performance: PerformanceConfig,
    pub target_fps: u32,
    /// A challenge step running longer than this has its progress reset.
    pub step_timeout: Duration,
    /// How long full progress stays on screen before advancing is due.
    pub advance_delay: Duration,
    pub init_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
            performance: PerformanceConfig::default(),
            target_fps: 30,
            step_timeout: Duration::from_secs(15),
            advance_delay: Duration::from_millis(1200),
            init_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `LIVENESS_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();

        let level: u8 = parse_var(&lookup, "LIVENESS_THROTTLING_LEVEL", 2)?;
        let mut performance = PerformanceConfig::from_level(ThrottlingLevel::try_from(level)?);
        performance.use_alternate_execution_context =
            flag_var(&lookup, "LIVENESS_OFFLOAD", false);

        let config = Self {
            model: ModelSettings {
                detection_confidence: parse_var(
                    &lookup,
                    "LIVENESS_DETECTION_CONFIDENCE",
                    defaults.model.detection_confidence,
                )?,
                max_faces: parse_var(&lookup, "LIVENESS_MAX_FACES", defaults.model.max_faces)?,
                landmarks_enabled: flag_var(&lookup, "LIVENESS_LANDMARKS", true),
                expressions_enabled: flag_var(&lookup, "LIVENESS_EXPRESSIONS", true),
            },
            performance,
            target_fps: parse_var(&lookup, "LIVENESS_TARGET_FPS", defaults.target_fps)?,
            step_timeout: Duration::from_millis(parse_var(
                &lookup,
                "LIVENESS_STEP_TIMEOUT_MS",
                defaults.step_timeout.as_millis() as u64,
            )?),
            advance_delay: Duration::from_millis(parse_var(
                &lookup,
                "LIVENESS_ADVANCE_DELAY_MS",
                defaults.advance_delay.as_millis() as u64,
            )?),
            init_retry: RetryPolicy {
                max_retries: parse_var(
                    &lookup,
                    "LIVENESS_INIT_RETRIES",
                    defaults.init_retry.max_retries,
                )?,
                backoff: Duration::from_millis(parse_var(
                    &lookup,
                    "LIVENESS_INIT_BACKOFF_MS",
                    defaults.init_retry.backoff.as_millis() as u64,
                )?),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let confidence = self.model.detection_confidence;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ConfigError::InvalidConfidence(confidence));
        }
        if self.model.max_faces == 0 {
            return Err(ConfigError::InvalidMaxFaces);
        }
        if self.target_fps == 0 {
            return Err(ConfigError::InvalidTargetFps(self.target_fps));
        }
        Ok(())
    }

    /// Time between scheduler ticks.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps.max(1)))
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn flag_var(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key).map(|v| v != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let config = load(&[]).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.performance.landmark_throttle, Duration::from_millis(200));
        assert_eq!(config.performance.expression_throttle, Duration::from_millis(400));
        assert_eq!(config.performance.max_skip_frames, 2);
        assert!(!config.performance.use_alternate_execution_context);
    }

    #[test]
    fn test_throttling_levels_expand() {
        let responsive = PerformanceConfig::from_level(ThrottlingLevel::Responsive);
        assert_eq!(responsive.landmark_throttle, Duration::from_millis(100));
        assert_eq!(responsive.expression_throttle, Duration::from_millis(200));
        assert_eq!(responsive.max_skip_frames, 1);

        let saver = PerformanceConfig::from_level(ThrottlingLevel::PowerSaver);
        assert_eq!(saver.landmark_throttle, Duration::from_millis(300));
        assert_eq!(saver.expression_throttle, Duration::from_millis(600));
        assert_eq!(saver.max_skip_frames, 3);
    }

    #[test]
    fn test_env_overrides() {
        let config = load(&[
            ("LIVENESS_THROTTLING_LEVEL", "3"),
            ("LIVENESS_OFFLOAD", "1"),
            ("LIVENESS_LANDMARKS", "0"),
            ("LIVENESS_DETECTION_CONFIDENCE", "0.7"),
            ("LIVENESS_TARGET_FPS", "15"),
            ("LIVENESS_STEP_TIMEOUT_MS", "5000"),
        ])
        .unwrap();

        assert_eq!(config.performance.throttling_level, ThrottlingLevel::PowerSaver);
        assert!(config.performance.use_alternate_execution_context);
        assert!(!config.model.landmarks_enabled);
        assert!(config.model.expressions_enabled);
        assert_eq!(config.model.detection_confidence, 0.7);
        assert_eq!(config.step_timeout, Duration::from_secs(5));
        assert_eq!(config.frame_interval(), Duration::from_secs_f64(1.0 / 15.0));
    }

    #[test]
    fn test_invalid_throttling_level() {
        assert_eq!(
            load(&[("LIVENESS_THROTTLING_LEVEL", "4")]),
            Err(ConfigError::InvalidThrottlingLevel(4))
        );
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        let err = load(&[("LIVENESS_MAX_FACES", "many")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "LIVENESS_MAX_FACES".to_string(),
                value: "many".to_string(),
            }
        );
        assert_eq!(
            load(&[("LIVENESS_MAX_FACES", "0")]),
            Err(ConfigError::InvalidMaxFaces)
        );
        assert_eq!(
            load(&[("LIVENESS_DETECTION_CONFIDENCE", "1.5")]),
            Err(ConfigError::InvalidConfidence(1.5))
        );
        assert_eq!(
            load(&[("LIVENESS_TARGET_FPS", "0")]),
            Err(ConfigError::InvalidTargetFps(0))
        );
    }
}
