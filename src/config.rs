use std::num::{ParseFloatError, ParseIntError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed override entry {0:?}, expected key:value")]
    MalformedEntry(String),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("probability {0} outside [0, 1]")]
    InvalidProbability(f32),
    #[error("loss thresholds low={low} high={high} must satisfy 0 < low <= high <= 1")]
    InvalidLossThresholds { low: f32, high: f32 },
    #[error("bitrate bounds min={min} max={max} invalid")]
    InvalidBitrateBounds { min: i64, max: i64 },
}

// WebRTC-BweLossExperiment
#[derive(Clone, Debug)]
pub struct LossExperimentConfig {
    /// Probability that a newly constructed estimator adopts the alternate
    /// thresholds below. Evaluated once, at construction.
    pub probability: f32,
    pub low_loss_threshold: f32,
    pub high_loss_threshold: f32,
    pub bitrate_threshold_kbps: i64,
}

impl Default for LossExperimentConfig {
    fn default() -> Self {
        Self {
            probability: 0.0,
            low_loss_threshold: 0.02,
            high_loss_threshold: 0.1,
            bitrate_threshold_kbps: 0,
        }
    }
}

/// Deployment configuration for the estimator. Every field has a documented
/// default; `parse` applies `key:value` overrides on top of those.
#[derive(Clone, Debug)]
pub struct BweConfig {
    pub start_bitrate_bps: i64,
    pub min_bitrate_bps: i64,
    /// Non-positive means "use the default ceiling" (1 Gbps).
    pub max_bitrate_bps: i64,
    pub loss_experiment: LossExperimentConfig,
    /// Probability that a newly constructed estimator treats prolonged
    /// feedback silence as a congestion signal (timeout experiment).
    pub timeout_experiment_probability: f32,
}

impl Default for BweConfig {
    fn default() -> Self {
        Self {
            start_bitrate_bps: 300_000,
            min_bitrate_bps: 10_000,
            max_bitrate_bps: 1_000_000_000,
            loss_experiment: LossExperimentConfig::default(),
            timeout_experiment_probability: 0.0,
        }
    }
}

impl BweConfig {
    /// Applies comma-separated `key:value` overrides to the defaults.
    /// Unknown keys are ignored with a warning so deployments can carry
    /// settings for newer builds.
    pub fn parse(overrides: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for entry in overrides.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry
                .split_once(':')
                .ok_or_else(|| ConfigError::MalformedEntry(entry.to_owned()))?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "start_bitrate_bps" => config.start_bitrate_bps = parse_int(key, value)?,
                "min_bitrate_bps" => config.min_bitrate_bps = parse_int(key, value)?,
                "max_bitrate_bps" => config.max_bitrate_bps = parse_int(key, value)?,
                "loss_experiment_probability" => {
                    config.loss_experiment.probability = parse_float(key, value)?
                }
                "low_loss_threshold" => {
                    config.loss_experiment.low_loss_threshold = parse_float(key, value)?
                }
                "high_loss_threshold" => {
                    config.loss_experiment.high_loss_threshold = parse_float(key, value)?
                }
                "bitrate_threshold_kbps" => {
                    config.loss_experiment.bitrate_threshold_kbps = parse_int(key, value)?
                }
                "timeout_experiment_probability" => {
                    config.timeout_experiment_probability = parse_float(key, value)?
                }
                _ => tracing::warn!("Ignoring unknown config key {:?}", key),
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Fails fast on construction parameters no estimator instance could run
    /// with. Called by `BandwidthEstimator::new`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for probability in [
            self.loss_experiment.probability,
            self.timeout_experiment_probability,
        ] {
            if !(0.0..=1.0).contains(&probability) {
                return Err(ConfigError::InvalidProbability(probability));
            }
        }
        let low = self.loss_experiment.low_loss_threshold;
        let high = self.loss_experiment.high_loss_threshold;
        if !(low > 0.0 && low <= high && high <= 1.0) {
            return Err(ConfigError::InvalidLossThresholds { low, high });
        }
        if self.loss_experiment.bitrate_threshold_kbps < 0 {
            return Err(ConfigError::InvalidBitrateBounds {
                min: self.min_bitrate_bps,
                max: self.loss_experiment.bitrate_threshold_kbps,
            });
        }
        if self.start_bitrate_bps <= 0
            || (self.max_bitrate_bps > 0 && self.max_bitrate_bps < self.min_bitrate_bps)
        {
            return Err(ConfigError::InvalidBitrateBounds {
                min: self.min_bitrate_bps,
                max: self.max_bitrate_bps,
            });
        }
        Ok(())
    }
}

fn parse_int(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse().map_err(|_: ParseIntError| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_float(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse().map_err(|_: ParseFloatError| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}
