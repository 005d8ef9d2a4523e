//! Error types shared across orderstream crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while building or parsing the shared data model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    #[error("Invalid customer range: {start}-{end}")]
    InvalidRange { start: i64, end: i64 },

    #[error("Unknown customer segment: {0}")]
    UnknownSegment(String),

    #[error("Unknown order status: {0}")]
    UnknownStatus(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
