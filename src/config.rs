use std::path::Path;

use serde::Deserialize;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnomalyBounds {
    pub heart_rate_low: f64,
    pub heart_rate_high: f64,
    pub spo2_low: f64,
}

impl Default for AnomalyBounds {
    fn default() -> Self {
        Self {
            heart_rate_low: 60.0,
            heart_rate_high: 100.0,
            spo2_low: 94.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub interval_ms: u64,
    pub heart_rate_jitter: f64,
    pub spo2_jitter: f64,
    pub capture_probability: f64,
    /// Samples one second apart seeded into the live window on selection.
    pub backfill: usize,
    /// Samples one hour apart seeded into the history on selection.
    pub history_seed: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            heart_rate_jitter: 5.0,
            spo2_jitter: 2.0,
            capture_probability: 0.05,
            backfill: 20,
            history_seed: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub live_window: usize,
    pub recent_threshold_secs: i64,
    pub anomaly: AnomalyBounds,
    pub synthetic: SyntheticConfig,
}

impl SyntheticConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(PipelineError::Config("synthetic interval must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.capture_probability) {
            return Err(PipelineError::Config(format!(
                "capture_probability {} outside [0, 1]",
                self.capture_probability
            )));
        }
        let jitter_ok = |jitter: f64| jitter.is_finite() && jitter >= 0.0;
        if !jitter_ok(self.heart_rate_jitter) || !jitter_ok(self.spo2_jitter) {
            return Err(PipelineError::Config(
                "jitter ranges must be finite and not negative".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            live_window: 20,
            recent_threshold_secs: 10,
            anomaly: AnomalyBounds::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| PipelineError::Config(format!("{}: {err}", path.display())))?;
        let config: PipelineConfig = serde_json::from_str(&raw)
            .map_err(|err| PipelineError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.live_window == 0 {
            return Err(PipelineError::Config("live_window must be positive".into()));
        }
        if self.recent_threshold_secs < 0 {
            return Err(PipelineError::Config(
                "recent_threshold_secs must not be negative".into(),
            ));
        }
        if self.anomaly.heart_rate_low > self.anomaly.heart_rate_high {
            return Err(PipelineError::Config(format!(
                "heart rate bounds inverted: {} > {}",
                self.anomaly.heart_rate_low, self.anomaly.heart_rate_high
            )));
        }
        self.synthetic.validate()
    }
}
