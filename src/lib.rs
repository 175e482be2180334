pub mod anomaly;
pub mod channel;
pub mod config;
pub mod error;
pub mod export;
pub mod feed;
pub mod models;
pub mod monitor;
pub mod normalize;
pub mod roster;
pub mod series;

pub use error::{PipelineError, Result};
pub use monitor::{Command, ExportPayload, Monitor, Update};
