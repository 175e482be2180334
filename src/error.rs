use thiserror::Error;

use crate::models::SubjectId;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A raw record is missing a required field or carries an unusable one.
    /// Callers skip the record and keep going.
    #[error("malformed record {key}: {reason}")]
    MalformedRecord { key: String, reason: String },

    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    /// A delivery arrived for a subscription that has already been torn down.
    #[error("stale delivery for subject {0}")]
    ChannelTeardownRace(SubjectId),

    #[error("subject {0} not found")]
    SubjectNotFound(SubjectId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("export failed: {0}")]
    Export(String),
}

impl PipelineError {
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::MalformedRecord {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
