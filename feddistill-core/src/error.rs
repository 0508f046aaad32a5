//! Error types for the feddistill-core crate.

use thiserror::Error;

use crate::client::ClientError;

/// Top-level error type for orchestration.
#[derive(Debug, Error)]
pub enum DistillError {
    #[error("Unknown metric '{name}', expected one of: {expected}")]
    UnknownMetric { name: String, expected: String },

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Duplicate client id: {0}")]
    DuplicateClient(String),

    #[error("Metric input error: {0}")]
    MetricInput(String),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("History written out of order: {0}")]
    HistoryOrder(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Report error: {0}")]
    Report(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config load error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl DistillError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn metric_input(msg: impl Into<String>) -> Self {
        Self::MetricInput(msg.into())
    }

    pub fn history_order(msg: impl Into<String>) -> Self {
        Self::HistoryOrder(msg.into())
    }

    pub fn report(msg: impl Into<String>) -> Self {
        Self::Report(msg.into())
    }
}
