// ⚠️ Error taxonomy - fatal errors vs. logged data-quality warnings
//
// Fatal errors stop a stage (EtlError). Warnings never stop anything: they
// are logged where they happen and carried in the stage reports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// FATAL ERRORS
// ============================================================================

/// Errors that abort a pipeline stage or an API request.
#[derive(Error, Debug)]
pub enum EtlError {
    /// No source file could be read for a stage.
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// Required columns are absent after reconciliation.
    #[error("Schema error in {context}: missing columns {missing:?}")]
    Schema {
        /// Which table was being validated.
        context: String,
        /// Canonical names of the missing columns.
        missing: Vec<String>,
    },

    /// A lookup found nothing (API 404).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A caller-supplied parameter is out of range (API 400).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[cfg(feature = "fetch")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EtlError {
    pub fn schema(context: &str, missing: Vec<String>) -> Self {
        EtlError::Schema {
            context: context.to_string(),
            missing,
        }
    }
}

/// Result type alias using [`EtlError`].
pub type Result<T> = std::result::Result<T, EtlError>;

// ============================================================================
// NON-FATAL WARNINGS
// ============================================================================

/// Data-quality signals. Logged, counted, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataWarning {
    /// A step was skipped because a column is missing (e.g. dedup without REG_ANS).
    SchemaWarning {
        message: String,
        available_columns: Vec<String>,
    },

    /// Expense rows without a registry match.
    UnmatchedRows { count: usize },

    /// A numeric cell that could not be parsed; the line was dropped.
    UnparseableNumber {
        file: String,
        line: usize,
        value: String,
    },

    /// Join keys that are not numeric; kept and joined verbatim.
    NonNumericKey { count: usize },

    /// An input row rejected before the join.
    RejectedRow {
        line: usize,
        reason: String,
    },

    /// A source file that could not be read and was skipped.
    UnreadableFile { file: String, reason: String },
}

impl DataWarning {
    pub fn summary(&self) -> String {
        match self {
            DataWarning::SchemaWarning { message, .. } => format!("schema: {}", message),
            DataWarning::UnmatchedRows { count } => {
                format!("{} rows without registry match", count)
            }
            DataWarning::UnparseableNumber { file, line, value } => {
                format!("{}:{} unparseable number {:?}", file, line, value)
            }
            DataWarning::NonNumericKey { count } => {
                format!("{} rows with non-numeric operator id", count)
            }
            DataWarning::RejectedRow { line, reason } => {
                format!("line {} rejected: {}", line, reason)
            }
            DataWarning::UnreadableFile { file, reason } => {
                format!("{} skipped: {}", file, reason)
            }
        }
    }
}
