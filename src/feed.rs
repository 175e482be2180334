use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::warn;

use crate::models::{AlertEvent, AudioEvent, SubjectId};
use crate::normalize::{normalize_alert, normalize_audio};

pub type RawCollection = Map<String, Value>;

/// Normalize a raw alert collection, newest first. Malformed entries are skipped.
pub fn ingest_alerts(raw: Option<&RawCollection>) -> Vec<AlertEvent> {
    let mut alerts: Vec<AlertEvent> = raw
        .into_iter()
        .flatten()
        .filter_map(|(key, record)| match normalize_alert(key, record) {
            Ok(alert) => Some(alert),
            Err(err) => {
                warn!(%err, "skipping alert");
                None
            }
        })
        .collect();
    alerts.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at).then_with(|| a.id.cmp(&b.id)));
    alerts
}

pub fn ingest_audio(raw: Option<&RawCollection>) -> Vec<AudioEvent> {
    let mut audio: Vec<AudioEvent> = raw
        .into_iter()
        .flatten()
        .filter_map(|(key, record)| match normalize_audio(key, record) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(%err, "skipping audio event");
                None
            }
        })
        .collect();
    audio.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at).then_with(|| a.id.cmp(&b.id)));
    audio
}

/// Per-subject alert and audio views. Every update replaces the whole view.
#[derive(Debug, Default)]
pub struct FeedSorter {
    alerts: HashMap<SubjectId, Vec<AlertEvent>>,
    audio: HashMap<SubjectId, Vec<AudioEvent>>,
}

impl FeedSorter {
    pub fn replace_alerts(&mut self, subject: SubjectId, raw: Option<&RawCollection>) -> usize {
        let alerts = ingest_alerts(raw);
        let count = alerts.len();
        self.alerts.insert(subject, alerts);
        count
    }

    pub fn replace_audio(&mut self, subject: SubjectId, raw: Option<&RawCollection>) -> usize {
        let audio = ingest_audio(raw);
        let count = audio.len();
        self.audio.insert(subject, audio);
        count
    }

    pub fn alerts(&self, subject: SubjectId) -> &[AlertEvent] {
        self.alerts.get(&subject).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn audio(&self, subject: SubjectId) -> &[AudioEvent] {
        self.audio.get(&subject).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn reset(&mut self, subject: SubjectId) {
        self.alerts.remove(&subject);
        self.audio.remove(&subject);
    }
}
