// 🏢 Registry Loader - active + cancelled operators as one table
//
// Each registry file is read, its columns reconciled to canonical names, and
// tagged with the status implied by its source. The files are then
// concatenated and deduplicated by operator id (first occurrence wins).

use crate::columns::{self, reconcile_columns, CanonicalColumn};
use crate::error::{DataWarning, EtlError, Result};
use crate::table::RawTable;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Added to every registry table; carries the status of the source file.
pub const STATUS_COLUMN: &str = "SITUACAO";

// ============================================================================
// OPERATOR RECORD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorStatus {
    Active,
    Cancelled,
}

impl OperatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorStatus::Active => "ATIVA",
            OperatorStatus::Cancelled => "CANCELADA",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "ATIVA" => Some(OperatorStatus::Active),
            "CANCELADA" => Some(OperatorStatus::Cancelled),
            _ => None,
        }
    }

    /// Registry files of cancelled operators say so in their name.
    pub fn from_file_name(path: &Path) -> Self {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_lowercase();

        if name.contains("cancel") {
            OperatorStatus::Cancelled
        } else {
            OperatorStatus::Active
        }
    }
}

/// Identity of a regulated operator. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorRecord {
    pub operator_id: String,
    pub tax_id: String,
    pub legal_name: String,
    pub modality: Option<String>,
    pub region: Option<String>,
    pub status: OperatorStatus,
}

// ============================================================================
// REGISTRY SET
// ============================================================================

/// Output of [`load_registry`].
#[derive(Debug, Clone)]
pub struct RegistrySet {
    /// Reconciled, concatenated and (when possible) deduplicated table.
    pub table: RawTable,
    pub files_loaded: usize,
    pub files_skipped: usize,
    pub duplicates_removed: usize,
    pub warnings: Vec<DataWarning>,
}

impl RegistrySet {
    /// Typed view of the registry. Rows without an operator id are skipped.
    pub fn operators(&self) -> Vec<OperatorRecord> {
        let id_col = CanonicalColumn::OperatorId.name();
        let mut operators = Vec::with_capacity(self.table.len());

        for row in 0..self.table.len() {
            let Some(raw_id) = self.table.get(row, id_col) else {
                continue;
            };
            let (operator_id, _) = columns::normalize_operator_id(raw_id);

            let cell = |col: CanonicalColumn| self.table.get(row, col.name()).map(str::to_string);

            operators.push(OperatorRecord {
                operator_id,
                tax_id: columns::normalize_tax_id(
                    self.table.get(row, CanonicalColumn::TaxId.name()).unwrap_or(""),
                ),
                legal_name: cell(CanonicalColumn::LegalName).unwrap_or_default(),
                modality: cell(CanonicalColumn::Modality),
                region: cell(CanonicalColumn::Region).map(|uf| uf.to_uppercase()),
                status: self
                    .table
                    .get(row, STATUS_COLUMN)
                    .and_then(OperatorStatus::parse)
                    .unwrap_or(OperatorStatus::Active),
            });
        }

        operators
    }
}

// ============================================================================
// LOADER
// ============================================================================

/// Registry files in `dir` whose name starts with `prefix` (`.csv` / `.txt`),
/// sorted by name so the active file precedes the cancelled one.
pub fn find_registry_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let lower = name.to_lowercase();
            name.starts_with(prefix) && (lower.ends_with(".csv") || lower.ends_with(".txt"))
        })
        .collect();

    files.sort();
    Ok(files)
}

/// Read one registry file and reconcile its columns.
pub fn read_registry_file(path: &Path) -> Result<RawTable> {
    let mut table = RawTable::read_delimited(path)?;
    let renames = reconcile_columns(&mut table);

    for rename in &renames {
        info!(
            file = %path.display(),
            from = %rename.from,
            to = rename.to.name(),
            "registry column reconciled"
        );
    }

    if !table.has_column(STATUS_COLUMN) {
        let status = OperatorStatus::from_file_name(path);
        table.headers.push(STATUS_COLUMN.to_string());
        for row in &mut table.rows {
            row.push(status.as_str().to_string());
        }
    }

    Ok(table)
}

/// Load, reconcile, concatenate and deduplicate registry files.
///
/// Unreadable files are logged and skipped; fails with `MissingInput` only
/// when none can be read.
pub fn load_registry(paths: &[PathBuf]) -> Result<RegistrySet> {
    info!(files = paths.len(), "loading operator registry (active + cancelled)");

    let mut tables = Vec::new();
    let mut warnings = Vec::new();
    let mut files_skipped = 0;

    for path in paths {
        match read_registry_file(path) {
            Ok(table) => {
                info!(file = %path.display(), rows = table.len(), "registry file read");
                tables.push(table);
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "failed to read registry file");
                files_skipped += 1;
                warnings.push(DataWarning::UnreadableFile {
                    file: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    if tables.is_empty() {
        error!("no operator registry could be loaded");
        return Err(EtlError::MissingInput(
            "no readable operator registry file".to_string(),
        ));
    }

    let files_loaded = tables.len();
    let combined = RawTable::concat(tables);
    let total_rows = combined.len();

    let (table, duplicates_removed) = if combined.has_column(CanonicalColumn::OperatorId.name()) {
        deduplicate_by_operator(combined)
    } else {
        warn!(
            columns = ?combined.headers,
            "REG_ANS column not found, skipping duplicate removal"
        );
        warnings.push(DataWarning::SchemaWarning {
            message: "REG_ANS column not found, deduplication skipped".to_string(),
            available_columns: combined.headers.clone(),
        });
        (combined, 0)
    };

    info!(
        total_rows,
        operators = table.len(),
        duplicates_removed,
        "operator registry loaded"
    );

    Ok(RegistrySet {
        table,
        files_loaded,
        files_skipped,
        duplicates_removed,
        warnings,
    })
}

/// Keep the first row per operator id. Rows with an empty id are kept as-is.
pub fn deduplicate_by_operator(table: RawTable) -> (RawTable, usize) {
    let Some(idx) = table.column_index(CanonicalColumn::OperatorId.name()) else {
        return (table, 0);
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut removed = 0;
    let mut out = RawTable::new(table.headers);

    for row in table.rows {
        let raw = row[idx].trim();
        if !raw.is_empty() {
            let (key, _) = columns::normalize_operator_id(raw);
            if !seen.insert(key) {
                removed += 1;
                continue;
            }
        }
        out.rows.push(row);
    }

    (out, removed)
}

// ============================================================================
// TESTS
// ============================================================================
