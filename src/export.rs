use csv::{QuoteStyle, Terminator, WriterBuilder};

use crate::error::{PipelineError, Result};
use crate::models::{Metric, SubjectId, VitalSample};

pub const CSV_MIME: &str = "text/csv";
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Id,
    Date,
    Value,
    Anomaly,
}

impl Column {
    pub const ALL: [Column; 4] = [Column::Id, Column::Date, Column::Value, Column::Anomaly];

    pub fn header(self) -> &'static str {
        match self {
            Column::Id => "ID",
            Column::Date => "Date",
            Column::Value => "Value",
            Column::Anomaly => "Anomaly",
        }
    }

    fn render(self, sample: &VitalSample) -> String {
        match self {
            Column::Id => sample.sequence_id.to_string(),
            Column::Date => sample.captured_at.format(DATE_FORMAT).to_string(),
            Column::Value => sample.value.to_string(),
            Column::Anomaly => sample.anomaly.to_string(),
        }
    }
}

/// Serialize a series as `ID,Date,Value,Anomaly` lines. Fields are written
/// unquoted; none of them can contain a comma.
pub fn format(series: &[VitalSample]) -> Result<String> {
    format_columns(series, &Column::ALL)
}

pub fn format_columns(series: &[VitalSample], columns: &[Column]) -> Result<String> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .quote_style(QuoteStyle::Never)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    let header: Vec<&str> = columns.iter().map(|column| column.header()).collect();
    writer
        .write_record(&header)
        .map_err(|err| PipelineError::Export(err.to_string()))?;

    for sample in series {
        let row: Vec<String> = columns.iter().map(|column| column.render(sample)).collect();
        writer
            .write_record(&row)
            .map_err(|err| PipelineError::Export(err.to_string()))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| PipelineError::Export(err.to_string()))?;
    String::from_utf8(bytes).map_err(|err| PipelineError::Export(err.to_string()))
}

pub fn export_filename(subject: SubjectId, metric: Metric) -> String {
    format!("subject{}_{}_data.csv", subject, metric.file_label())
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSummary {
    pub count: usize,
    pub average: f64,
    pub latest: Option<f64>,
    pub anomaly_count: usize,
}

pub fn summarize(series: &[VitalSample]) -> SeriesSummary {
    let count = series.len();
    let total: f64 = series.iter().map(|sample| sample.value).sum();

    SeriesSummary {
        count,
        average: if count == 0 { 0.0 } else { total / count as f64 },
        latest: series.last().map(|sample| sample.value),
        anomaly_count: series.iter().filter(|sample| sample.anomaly).count(),
    }
}
