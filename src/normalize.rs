use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::models::{AlertEvent, AlertKind, AudioEvent, Metric, Reading, SequenceId};

/// Accepts epoch milliseconds (number or numeric string), RFC 3339, or a
/// naive `YYYY-MM-DD HH:MM:SS` string read as UTC.
pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::Number(number) => {
            let millis = number
                .as_i64()
                .or_else(|| number.as_f64().map(|value| value.round() as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(text) => parse_timestamp_str(text.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(millis) = text.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

fn as_object<'a>(key: &str, raw: &'a Value) -> Result<&'a Map<String, Value>> {
    raw.as_object()
        .ok_or_else(|| PipelineError::malformed(key, "record is not an object"))
}

fn required_timestamp(key: &str, record: &Map<String, Value>) -> Result<DateTime<Utc>> {
    let raw = record
        .get("timestamp")
        .ok_or_else(|| PipelineError::malformed(key, "missing timestamp"))?;
    parse_timestamp(raw)
        .ok_or_else(|| PipelineError::malformed(key, format!("unreadable timestamp {raw}")))
}

fn optional_f64(record: &Map<String, Value>, field: &str) -> Option<f64> {
    record.get(field).and_then(Value::as_f64)
}

fn optional_string(record: &Map<String, Value>, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        _ => None,
    }
}

fn flag(record: &Map<String, Value>, field: &str) -> bool {
    record.get(field).and_then(Value::as_bool).unwrap_or(false)
}

/// An explicit `id` field wins over the collection key.
fn sequence_id(key: &str, record: &Map<String, Value>) -> SequenceId {
    match record.get("id") {
        Some(Value::Number(number)) if number.is_u64() => {
            SequenceId::Int(number.as_u64().unwrap_or_default())
        }
        Some(Value::String(text)) if !text.is_empty() => SequenceId::Text(text.clone()),
        _ => SequenceId::Text(key.to_string()),
    }
}

fn event_id(key: &str, record: &Map<String, Value>) -> String {
    sequence_id(key, record).to_string()
}

/// One vitals record carries both metrics; this extracts one of them.
pub fn normalize_vital(key: &str, raw: &Value, metric: Metric) -> Result<Reading> {
    let record = as_object(key, raw)?;
    let captured_at = required_timestamp(key, record)?;
    let value = optional_f64(record, metric.raw_field()).ok_or_else(|| {
        PipelineError::malformed(key, format!("missing numeric {}", metric.raw_field()))
    })?;

    Ok(Reading {
        sequence_id: sequence_id(key, record),
        captured_at,
        metric,
        value,
    })
}

pub fn normalize_alert(key: &str, raw: &Value) -> Result<AlertEvent> {
    let record = as_object(key, raw)?;
    let occurred_at = required_timestamp(key, record)?;
    let kind = record
        .get("alert_type")
        .and_then(Value::as_str)
        .ok_or_else(|| PipelineError::malformed(key, "missing alert_type"))?
        .parse::<AlertKind>()
        .map_err(|reason: String| PipelineError::malformed(key, reason))?;

    Ok(AlertEvent {
        id: event_id(key, record),
        occurred_at,
        kind,
        source: optional_string(record, "source"),
        numeric_value: optional_f64(record, "value"),
        threshold_value: optional_f64(record, "threshold"),
        keyword: optional_string(record, "keyword"),
        confidence: optional_f64(record, "confidence").map(|value| value.clamp(0.0, 1.0)),
        anomaly_score: optional_f64(record, "anomaly_score"),
    })
}

pub fn normalize_audio(key: &str, raw: &Value) -> Result<AudioEvent> {
    let record = as_object(key, raw)?;
    let occurred_at = required_timestamp(key, record)?;
    let file_path = optional_string(record, "filepath")
        .ok_or_else(|| PipelineError::malformed(key, "missing filepath"))?;

    Ok(AudioEvent {
        id: event_id(key, record),
        occurred_at,
        file_path,
        processed: flag(record, "processed"),
        keyword_detected: flag(record, "keyword_detected"),
        keyword: optional_string(record, "keyword"),
        confidence: optional_f64(record, "confidence").map(|value| value.clamp(0.0, 1.0)),
    })
}

/// Images only matter for their capture time.
pub fn normalize_image(key: &str, raw: &Value) -> Result<DateTime<Utc>> {
    let record = as_object(key, raw)?;
    required_timestamp(key, record)
}
