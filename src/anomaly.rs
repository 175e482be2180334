use chrono::{DateTime, Duration, Utc};

use crate::config::AnomalyBounds;
use crate::error::Result;
use crate::models::{Metric, VitalSample};

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    bounds: AnomalyBounds,
}

impl Classifier {
    pub fn new(bounds: AnomalyBounds) -> Self {
        Self { bounds }
    }

    pub fn classify(&self, metric: Metric, value: f64) -> bool {
        match metric {
            Metric::HeartRate => {
                value > self.bounds.heart_rate_high || value < self.bounds.heart_rate_low
            }
            Metric::SpO2 => value < self.bounds.spo2_low,
        }
    }

    pub fn range_status(&self, metric: Metric, value: f64) -> RangeStatus {
        match (metric, self.classify(metric, value)) {
            (_, false) => RangeStatus::Normal,
            (Metric::HeartRate, true) => RangeStatus::OutsideNormal,
            (Metric::SpO2, true) => RangeStatus::BelowNormal,
        }
    }
}

/// Classify against the default clinical bounds.
pub fn classify(metric: Metric, value: f64) -> bool {
    Classifier::default().classify(metric, value)
}

/// Resolve a metric name at the wiring boundary, then classify.
pub fn classify_named(metric: &str, value: f64) -> Result<bool> {
    Ok(classify(metric.parse()?, value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeStatus {
    Normal,
    OutsideNormal,
    BelowNormal,
}

impl RangeStatus {
    pub fn label(self) -> &'static str {
        match self {
            RangeStatus::Normal => "Normal range",
            RangeStatus::OutsideNormal => "Outside normal range",
            RangeStatus::BelowNormal => "Below normal range",
        }
    }
}

/// Current readout: the last live-window value rounded, or 0 when empty.
pub fn current_value(window: &[VitalSample]) -> i64 {
    window
        .last()
        .map(|sample| sample.value.round() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recency {
    NotAvailable,
    JustNow,
    At(DateTime<Utc>),
}

pub fn recency(
    latest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Recency {
    match latest {
        None => Recency::NotAvailable,
        Some(at) if now - at < threshold => Recency::JustNow,
        Some(at) => Recency::At(at),
    }
}

impl Recency {
    pub fn label(&self) -> String {
        match self {
            Recency::NotAvailable => "N/A".to_string(),
            Recency::JustNow => "Just now".to_string(),
            Recency::At(at) => at.format("%H:%M:%S").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SequenceId;
    use chrono::TimeZone;

    fn sample(value: f64) -> VitalSample {
        VitalSample {
            sequence_id: SequenceId::Int(1),
            captured_at: Utc.timestamp_millis_opt(0).unwrap(),
            metric: Metric::HeartRate,
            value,
            anomaly: false,
        }
    }

    #[test]
    fn heart_rate_bounds_are_exclusive() {
        assert!(classify(Metric::HeartRate, 101.0));
        assert!(!classify(Metric::HeartRate, 100.0));
        assert!(!classify(Metric::HeartRate, 60.0));
        assert!(classify(Metric::HeartRate, 59.0));
    }

    #[test]
    fn spo2_flags_only_low_values() {
        assert!(classify(Metric::SpO2, 93.0));
        assert!(!classify(Metric::SpO2, 94.0));
        assert!(!classify(Metric::SpO2, 100.0));
    }

    #[test]
    fn named_metrics_resolve_or_fail() {
        assert!(classify_named("heartRate", 101.0).unwrap());
        assert!(!classify_named("spO2", 94.0).unwrap());
        assert!(classify_named("temperature", 37.0).is_err());
    }

    #[test]
    fn custom_bounds_are_respected() {
        let classifier = Classifier::new(AnomalyBounds {
            heart_rate_low: 40.0,
            heart_rate_high: 120.0,
            spo2_low: 90.0,
        });
        assert!(!classifier.classify(Metric::HeartRate, 110.0));
        assert!(classifier.classify(Metric::SpO2, 89.0));
    }

    #[test]
    fn range_status_labels_follow_metric() {
        let classifier = Classifier::default();
        assert_eq!(
            classifier.range_status(Metric::HeartRate, 120.0).label(),
            "Outside normal range"
        );
        assert_eq!(
            classifier.range_status(Metric::SpO2, 90.0).label(),
            "Below normal range"
        );
        assert_eq!(classifier.range_status(Metric::SpO2, 97.0), RangeStatus::Normal);
    }

    #[test]
    fn current_value_rounds_last_sample() {
        assert_eq!(current_value(&[]), 0);
        assert_eq!(current_value(&[sample(70.0), sample(77.6)]), 78);
    }

    #[test]
    fn recency_uses_threshold() {
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        let threshold = Duration::seconds(10);
        assert_eq!(recency(None, now, threshold), Recency::NotAvailable);
        assert_eq!(
            recency(Some(now - Duration::seconds(3)), now, threshold),
            Recency::JustNow
        );
        let stale = now - Duration::seconds(30);
        assert_eq!(recency(Some(stale), now, threshold), Recency::At(stale));
        assert_eq!(Recency::At(stale).label(), "00:16:10");
    }
}
