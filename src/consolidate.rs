// 🔗 Consolidator - expenses ⟕ registry → sorted flat file + archive
//
// Left join on operator id: every expense row survives, registry identity is
// attached when found. Output order is (year asc, quarter asc, value desc)
// with a stable sort, so equal inputs always produce the same bytes.

use crate::columns::{self, CanonicalColumn, FINAL_BALANCE, QUARTER, YEAR};
use crate::error::{DataWarning, EtlError, Result};
use crate::statement::parse_decimal;
use crate::table::RawTable;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONSOLIDATED_FILE: &str = "despesas_consolidadas_final.csv";
pub const CONSOLIDATED_ARCHIVE: &str = "consolidado_despesas.zip";

/// Columns the expense table must carry.
pub const EXPENSE_COLUMNS: [&str; 4] = ["REG_ANS", YEAR, QUARTER, FINAL_BALANCE];

/// Columns the registry must carry after reconciliation.
pub const REGISTRY_COLUMNS: [&str; 3] = ["REG_ANS", "CNPJ", "RAZAO_SOCIAL"];

/// Output column order of the flat file.
pub const OUTPUT_COLUMNS: [&str; 6] = ["REG_ANS", "CNPJ", "RAZAO_SOCIAL", YEAR, QUARTER, FINAL_BALANCE];

// ============================================================================
// CONSOLIDATED RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRecord {
    pub operator_id: String,
    /// None when the operator is not in the registry.
    pub tax_id: Option<String>,
    /// None when the operator is not in the registry.
    pub legal_name: Option<String>,
    pub year: i32,
    pub quarter: u8,
    pub value: f64,
}

impl ConsolidatedRecord {
    fn to_row(&self) -> Vec<String> {
        vec![
            self.operator_id.clone(),
            self.tax_id.clone().unwrap_or_default(),
            self.legal_name.clone().unwrap_or_default(),
            self.year.to_string(),
            self.quarter.to_string(),
            format!("{:.2}", self.value),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct ConsolidationReport {
    pub records: Vec<ConsolidatedRecord>,
    pub expense_rows: usize,
    pub unmatched_rows: usize,
    pub rejected_rows: usize,
    pub non_numeric_keys: usize,
    pub warnings: Vec<DataWarning>,
}

/// Paths and digest of the written artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationOutput {
    pub flat_file: PathBuf,
    pub archive: PathBuf,
    pub sha256: String,
    pub rows: usize,
}

// ============================================================================
// JOIN
// ============================================================================

/// Identity fields looked up by operator id.
struct Identity {
    tax_id: Option<String>,
    legal_name: Option<String>,
}

/// Validate both inputs, left-join, project and sort.
pub fn consolidate(expenses: &RawTable, registry: &RawTable) -> Result<ConsolidationReport> {
    let missing = expenses.missing_columns(&EXPENSE_COLUMNS);
    if !missing.is_empty() {
        return Err(EtlError::schema("expenses", missing));
    }
    let missing = registry.missing_columns(&REGISTRY_COLUMNS);
    if !missing.is_empty() {
        return Err(EtlError::schema("registry", missing));
    }

    info!(
        expense_rows = expenses.len(),
        registry_rows = registry.len(),
        "joining expenses with operator registry"
    );

    let lookup = build_lookup(registry);
    let id_col = CanonicalColumn::OperatorId.name();

    let mut records = Vec::with_capacity(expenses.len());
    let mut warnings = Vec::new();
    let mut unmatched_rows = 0;
    let mut rejected_rows = 0;
    let mut non_numeric_keys = 0;

    for row in 0..expenses.len() {
        let line = row + 2;

        let parsed = (
            expenses.get(row, id_col),
            expenses.get(row, YEAR).and_then(|v| v.parse::<i32>().ok()),
            expenses
                .get(row, QUARTER)
                .and_then(|v| v.parse::<u8>().ok())
                .filter(|q| (1..=4).contains(q)),
            expenses.get(row, FINAL_BALANCE).and_then(parse_decimal),
        );

        let (Some(raw_id), Some(year), Some(quarter), Some(value)) = parsed else {
            rejected_rows += 1;
            warn!(line, "expense row rejected: missing or malformed key fields");
            warnings.push(DataWarning::RejectedRow {
                line,
                reason: "missing or malformed REG_ANS/ano/trimestre/VL_SALDO_FINAL".to_string(),
            });
            continue;
        };

        let (operator_id, numeric) = columns::normalize_operator_id(raw_id);
        if !numeric {
            non_numeric_keys += 1;
        }

        let (tax_id, legal_name) = match lookup.get(&operator_id) {
            Some(identity) => (identity.tax_id.clone(), identity.legal_name.clone()),
            None => {
                unmatched_rows += 1;
                (None, None)
            }
        };

        records.push(ConsolidatedRecord {
            operator_id,
            tax_id,
            legal_name,
            year,
            quarter,
            value,
        });
    }

    if non_numeric_keys > 0 {
        warn!(count = non_numeric_keys, "expense rows with non-numeric operator id, joined verbatim");
        warnings.push(DataWarning::NonNumericKey {
            count: non_numeric_keys,
        });
    }

    if unmatched_rows > 0 {
        warn!(count = unmatched_rows, "expense rows without match in the ANS registry");
        warnings.push(DataWarning::UnmatchedRows {
            count: unmatched_rows,
        });
    }

    sort_records(&mut records);

    Ok(ConsolidationReport {
        records,
        expense_rows: expenses.len(),
        unmatched_rows,
        rejected_rows,
        non_numeric_keys,
        warnings,
    })
}

fn build_lookup(registry: &RawTable) -> HashMap<String, Identity> {
    let mut lookup = HashMap::with_capacity(registry.len());

    for row in 0..registry.len() {
        let Some(raw_id) = registry.get(row, CanonicalColumn::OperatorId.name()) else {
            continue;
        };
        let (operator_id, _) = columns::normalize_operator_id(raw_id);

        // First row wins, same as registry dedup
        lookup.entry(operator_id).or_insert_with(|| Identity {
            tax_id: registry
                .get(row, CanonicalColumn::TaxId.name())
                .map(columns::normalize_tax_id)
                .filter(|t| !t.is_empty()),
            legal_name: registry
                .get(row, CanonicalColumn::LegalName.name())
                .map(str::to_string),
        });
    }

    lookup
}

/// Year asc, quarter asc, value desc. Stable: ties keep input order.
pub fn sort_records(records: &mut [ConsolidatedRecord]) {
    records.sort_by(|a, b| {
        a.year
            .cmp(&b.year)
            .then(a.quarter.cmp(&b.quarter))
            .then(b.value.total_cmp(&a.value))
    });
}

// ============================================================================
// OUTPUT
// ============================================================================

pub fn consolidated_table(records: &[ConsolidatedRecord]) -> RawTable {
    let mut table = RawTable::new(OUTPUT_COLUMNS.iter().map(|c| c.to_string()).collect());
    table.rows = records.iter().map(ConsolidatedRecord::to_row).collect();
    table
}

/// Write the flat file and its archive into `dir`.
pub fn write_outputs(records: &[ConsolidatedRecord], dir: &Path) -> Result<ConsolidationOutput> {
    fs::create_dir_all(dir)?;

    let flat_file = dir.join(CONSOLIDATED_FILE);
    consolidated_table(records).write_delimited(&flat_file)?;
    let sha256 = file_sha256(&flat_file)?;
    info!(path = %flat_file.display(), rows = records.len(), sha256 = %sha256, "consolidated file written");

    let archive = dir.join(CONSOLIDATED_ARCHIVE);
    write_archive(&flat_file, &archive)?;
    info!(path = %archive.display(), "consolidated archive written");

    Ok(ConsolidationOutput {
        flat_file,
        archive,
        sha256,
        rows: records.len(),
    })
}

/// Archive holding exactly `file` under its base name.
///
/// The entry timestamp is pinned to the DOS epoch so the archive bytes depend
/// only on the file content.
pub fn write_archive(file: &Path, archive: &Path) -> Result<()> {
    let entry_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EtlError::Internal(format!("invalid file name: {}", file.display())))?
        .to_string();

    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    let mut writer = zip::ZipWriter::new(File::create(archive)?);
    writer.start_file(entry_name, options)?;
    let mut source = File::open(file)?;
    io::copy(&mut source, &mut writer)?;
    writer.finish()?.flush()?;
    Ok(())
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Read a consolidated flat file back into records.
pub fn read_consolidated(path: &Path) -> Result<Vec<ConsolidatedRecord>> {
    let table = RawTable::read_delimited(path)?;
    let missing = table.missing_columns(&OUTPUT_COLUMNS);
    if !missing.is_empty() {
        return Err(EtlError::schema("consolidated file", missing));
    }

    let mut records = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        let parsed = (
            table.get(row, "REG_ANS"),
            table.get(row, YEAR).and_then(|v| v.parse::<i32>().ok()),
            table.get(row, QUARTER).and_then(|v| v.parse::<u8>().ok()),
            table.get(row, FINAL_BALANCE).and_then(parse_decimal),
        );
        let (Some(operator_id), Some(year), Some(quarter), Some(value)) = parsed else {
            warn!(line = row + 2, path = %path.display(), "malformed consolidated row skipped");
            continue;
        };

        records.push(ConsolidatedRecord {
            operator_id: operator_id.to_string(),
            tax_id: table.get(row, "CNPJ").map(str::to_string),
            legal_name: table.get(row, "RAZAO_SOCIAL").map(str::to_string),
            year,
            quarter,
            value,
        });
    }

    Ok(records)
}

// ============================================================================
// TESTS
// ============================================================================
