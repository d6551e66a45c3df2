/// Centralized error types for the cascade engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CascadeError {
    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid cascade table: {0}")]
    InvalidCascadeTable(String),

    // Data Errors
    #[error("Invalid bar data: {0}")]
    InvalidBarData(String),

    #[error("Timeframe mismatch: expected {expected}s, got {actual}s")]
    TimeframeMismatch { expected: i64, actual: i64 },

    #[error("Bar invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // Generic Errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, CascadeError>;

impl CascadeError {
    /// Errors that must stop the process before any bar is processed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CascadeError::ConfigError(_)
                | CascadeError::InvalidParameter(_)
                | CascadeError::InvalidCascadeTable(_)
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            CascadeError::ConfigError(_) => "CFG_001",
            CascadeError::InvalidParameter(_) => "CFG_002",
            CascadeError::InvalidCascadeTable(_) => "CFG_003",
            CascadeError::InvalidBarData(_) => "DATA_001",
            CascadeError::TimeframeMismatch { .. } => "DATA_002",
            CascadeError::InvariantViolation(_) => "DATA_003",
            CascadeError::UnknownSymbol(_) => "DATA_004",
            CascadeError::DeserializationError(_) => "DATA_005",
            CascadeError::FileError(_) => "FILE_001",
            CascadeError::InternalError(_) => "INT_001",
        }
    }
}
