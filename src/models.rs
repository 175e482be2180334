use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub type SubjectId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    HeartRate,
    SpO2,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::HeartRate, Metric::SpO2];

    pub fn name(self) -> &'static str {
        match self {
            Metric::HeartRate => "heartRate",
            Metric::SpO2 => "spO2",
        }
    }

    /// Key of this metric inside a raw vitals record.
    pub fn raw_field(self) -> &'static str {
        match self {
            Metric::HeartRate => "heart_rate",
            Metric::SpO2 => "spo2",
        }
    }

    /// Name used in export file names.
    pub fn file_label(self) -> &'static str {
        match self {
            Metric::HeartRate => "heartrate",
            Metric::SpO2 => "spo2",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "heartrate" | "bpm" => Ok(Metric::HeartRate),
            "spo2" => Ok(Metric::SpO2),
            _ => Err(PipelineError::UnknownMetric(value.to_string())),
        }
    }
}

/// Identity of a sample within one subject and metric. Feed records are
/// keyed by text, synthetic samples by a counter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceId {
    Int(u64),
    Text(String),
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceId::Int(value) => write!(f, "{value}"),
            SequenceId::Text(value) => f.write_str(value),
        }
    }
}

impl From<u64> for SequenceId {
    fn from(value: u64) -> Self {
        SequenceId::Int(value)
    }
}

impl From<&str> for SequenceId {
    fn from(value: &str) -> Self {
        SequenceId::Text(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedMode {
    LiveFeed,
    Synthetic,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subject {
    pub id: SubjectId,
    pub name: String,
    pub age: u32,
    pub device_id: String,
    pub status: String,
    pub heart_rate_baseline: f64,
    pub spo2_baseline: f64,
    pub mode: FeedMode,
}

impl Subject {
    pub fn baseline(&self, metric: Metric) -> f64 {
        match metric {
            Metric::HeartRate => self.heart_rate_baseline,
            Metric::SpO2 => self.spo2_baseline,
        }
    }
}

/// A normalized reading that has not been classified yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sequence_id: SequenceId,
    pub captured_at: DateTime<Utc>,
    pub metric: Metric,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VitalSample {
    pub sequence_id: SequenceId,
    pub captured_at: DateTime<Utc>,
    pub metric: Metric,
    pub value: f64,
    pub anomaly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Threshold,
    Keyword,
    Anomaly,
}

impl FromStr for AlertKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "threshold" => Ok(AlertKind::Threshold),
            "keyword" => Ok(AlertKind::Keyword),
            "anomaly" => Ok(AlertKind::Anomaly),
            other => Err(format!("unknown alert_type {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub id: String,
    pub occurred_at: DateTime<Utc>,
    pub kind: AlertKind,
    pub source: Option<String>,
    pub numeric_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub keyword: Option<String>,
    pub confidence: Option<f64>,
    pub anomaly_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioEvent {
    pub id: String,
    pub occurred_at: DateTime<Utc>,
    pub file_path: String,
    pub processed: bool,
    pub keyword_detected: bool,
    pub keyword: Option<String>,
    pub confidence: Option<f64>,
}
