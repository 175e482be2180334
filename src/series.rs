use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::anomaly::Classifier;
use crate::models::{Metric, Reading, SequenceId, SubjectId, VitalSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Samples for one subject and metric, ascending by (captured_at, sequence_id).
#[derive(Debug, Default)]
struct MetricSeries {
    samples: Vec<VitalSample>,
    ids: HashSet<SequenceId>,
}

impl MetricSeries {
    fn insert(&mut self, sample: VitalSample) -> InsertOutcome {
        if self.ids.contains(&sample.sequence_id) {
            return InsertOutcome::Duplicate;
        }
        self.ids.insert(sample.sequence_id.clone());

        let key = (sample.captured_at, &sample.sequence_id);
        let position = self
            .samples
            .partition_point(|existing| (existing.captured_at, &existing.sequence_id) < key);
        self.samples.insert(position, sample);
        InsertOutcome::Inserted
    }

    fn remove(&mut self, id: &SequenceId) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.samples.retain(|sample| &sample.sequence_id != id);
        true
    }

    fn tail(&self, limit: usize) -> &[VitalSample] {
        let start = self.samples.len().saturating_sub(limit);
        &self.samples[start..]
    }
}

#[derive(Debug, Default)]
struct SubjectSeries {
    heart_rate: MetricSeries,
    spo2: MetricSeries,
}

impl SubjectSeries {
    fn metric(&self, metric: Metric) -> &MetricSeries {
        match metric {
            Metric::HeartRate => &self.heart_rate,
            Metric::SpO2 => &self.spo2,
        }
    }

    fn metric_mut(&mut self, metric: Metric) -> &mut MetricSeries {
        match metric {
            Metric::HeartRate => &mut self.heart_rate,
            Metric::SpO2 => &mut self.spo2,
        }
    }
}

/// Owns the historical series of every subject and derives live windows
/// from them. Anomaly flags are computed here on insertion.
#[derive(Debug)]
pub struct SeriesAggregator {
    classifier: Classifier,
    window: usize,
    subjects: HashMap<SubjectId, SubjectSeries>,
}

impl SeriesAggregator {
    pub fn new(classifier: Classifier, window: usize) -> Self {
        Self {
            classifier,
            window,
            subjects: HashMap::new(),
        }
    }

    fn classify(&self, reading: Reading) -> VitalSample {
        let anomaly = self.classifier.classify(reading.metric, reading.value);
        VitalSample {
            sequence_id: reading.sequence_id,
            captured_at: reading.captured_at,
            metric: reading.metric,
            value: reading.value,
            anomaly,
        }
    }

    pub fn insert(&mut self, subject: SubjectId, reading: Reading) -> InsertOutcome {
        let sample = self.classify(reading);
        let metric = sample.metric;
        let outcome = self
            .subjects
            .entry(subject)
            .or_default()
            .metric_mut(metric)
            .insert(sample);
        if outcome == InsertOutcome::Duplicate {
            debug!(subject, %metric, "duplicate sample ignored");
        }
        outcome
    }

    /// Swap out a sample whose upstream record changed in place.
    pub fn replace(&mut self, subject: SubjectId, reading: Reading) -> InsertOutcome {
        let sample = self.classify(reading);
        let series = self
            .subjects
            .entry(subject)
            .or_default()
            .metric_mut(sample.metric);
        series.remove(&sample.sequence_id);
        series.insert(sample)
    }

    /// Drop a sample whose upstream record no longer carries it.
    pub fn remove(&mut self, subject: SubjectId, metric: Metric, id: &SequenceId) -> bool {
        self.subjects
            .get_mut(&subject)
            .is_some_and(|series| series.metric_mut(metric).remove(id))
    }

    pub fn live_window(&self, subject: SubjectId, metric: Metric) -> &[VitalSample] {
        self.subjects
            .get(&subject)
            .map(|series| series.metric(metric).tail(self.window))
            .unwrap_or(&[])
    }

    pub fn historical_series(&self, subject: SubjectId, metric: Metric) -> &[VitalSample] {
        self.subjects
            .get(&subject)
            .map(|series| series.metric(metric).samples.as_slice())
            .unwrap_or(&[])
    }

    pub fn latest_timestamp(&self, subject: SubjectId) -> Option<DateTime<Utc>> {
        let series = self.subjects.get(&subject)?;
        Metric::ALL
            .iter()
            .filter_map(|metric| series.metric(*metric).samples.last())
            .map(|sample| sample.captured_at)
            .max()
    }

    pub fn reset(&mut self, subject: SubjectId) {
        self.subjects.remove(&subject);
    }
}
