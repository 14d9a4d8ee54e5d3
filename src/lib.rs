// ANS Consolidation - Core Library
// Registry + statement ingestion, consolidation, store and query API

pub mod aggregate;
pub mod columns;
pub mod config;
pub mod consolidate;
pub mod db;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod registry;
pub mod statement;
pub mod table;
pub mod validate;

#[cfg(feature = "fetch")]
pub mod fetch;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use aggregate::{OperatorAggregate, SummaryStats};
pub use columns::CanonicalColumn;
pub use config::{PipelineConfig, ServerConfig};
pub use consolidate::{consolidate, ConsolidatedRecord, ConsolidationReport};
pub use error::{DataWarning, EtlError, Result};
pub use pipeline::Pipeline;
pub use registry::{load_registry, OperatorRecord, OperatorStatus, RegistrySet};
pub use statement::{ExpenseRecord, Period, StatementFilter};
pub use table::RawTable;
pub use validate::{QualityReport, RecordValidator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
