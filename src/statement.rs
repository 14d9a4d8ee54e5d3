// 📑 Statement Parser - quarterly financial statements → expense records
//
// A statement lists every accounting line of every operator for one quarter.
// We keep the lines of the configured expense account, read their final
// balance, and emit one ExpenseRecord per operator.

use crate::columns::{self, CanonicalColumn, ACCOUNT_CODE, DESCRIPTION, FINAL_BALANCE, QUARTER, YEAR};
use crate::error::{DataWarning, EtlError, Result};
use crate::table::RawTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default expense line: claims incurred on health care.
pub const DEFAULT_EXPENSE_DESCRIPTION: &str = "EVENTOS/ SINISTROS CONHECIDOS OU AVISADOS";

/// Upper bound on the buffer reserved from an archive entry's declared size.
const MAX_ENTRY_PREALLOC: u64 = 64 * 1024 * 1024;

/// Declared entry sizes come from the archive header and are untrusted.
fn entry_capacity(declared: u64) -> usize {
    declared.min(MAX_ENTRY_PREALLOC) as usize
}

// ============================================================================
// PERIOD
// ============================================================================

/// A reporting quarter. Orders chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub quarter: u8,
}

impl Period {
    pub fn new(year: i32, quarter: u8) -> Option<Self> {
        if (1..=4).contains(&quarter) {
            Some(Period { year, quarter })
        } else {
            None
        }
    }

    /// File stem used by the archive: "1T2023".
    pub fn label(&self) -> String {
        format!("{}T{}", self.quarter, self.year)
    }

    /// Quarter immediately before this one.
    pub fn previous(&self) -> Period {
        if self.quarter == 1 {
            Period {
                year: self.year - 1,
                quarter: 4,
            }
        } else {
            Period {
                year: self.year,
                quarter: self.quarter - 1,
            }
        }
    }

    /// Find "{q}T{yyyy}" anywhere in a file name ("1T2023.zip", "dados_3T2024.csv").
    pub fn from_file_name(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_uppercase();
        let bytes = name.as_bytes();

        for i in 0..bytes.len() {
            if bytes[i] != b'T' || i == 0 || i + 5 > bytes.len() {
                continue;
            }
            let q = bytes[i - 1];
            let year = &bytes[i + 1..i + 5];
            let year_is_digits = year.iter().all(|b| b.is_ascii_digit());
            let boundary_ok = i < 2 || !bytes[i - 2].is_ascii_digit();
            let after_ok = i + 5 == bytes.len() || !bytes[i + 5].is_ascii_digit();

            if (b'1'..=b'4').contains(&q) && year_is_digits && boundary_ok && after_ok {
                let year: i32 = std::str::from_utf8(year).ok()?.parse().ok()?;
                return Period::new(year, q - b'0');
            }
        }
        None
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// EXPENSE RECORD
// ============================================================================

/// One (operator, year, quarter) observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseRecord {
    pub operator_id: String,
    pub year: i32,
    pub quarter: u8,
    pub value: f64,
}

// ============================================================================
// NUMERIC PARSING
// ============================================================================

/// Parse a decimal written with either locale convention.
///
/// "1.234,56", "1,234.56", "1234,56", "1234.56", "-12,5" all parse; the last
/// of '.' / ',' is the decimal separator when both appear. Returns `None` for
/// anything that is not a finite number.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(_)) => {
            if cleaned.matches(',').count() == 1 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (Some(_), None) => {
            if cleaned.matches('.').count() == 1 {
                cleaned
            } else {
                cleaned.replace('.', "")
            }
        }
        (None, None) => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

// ============================================================================
// STATEMENT FILTER
// ============================================================================

/// Which accounting lines count as operator expenses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementFilter {
    /// Substring of DESCRICAO (case-insensitive, whitespace collapsed).
    pub description_contains: String,
    /// Optional prefix of CD_CONTA_CONTABIL.
    pub account_prefix: Option<String>,
}

impl Default for StatementFilter {
    fn default() -> Self {
        StatementFilter {
            description_contains: DEFAULT_EXPENSE_DESCRIPTION.to_string(),
            account_prefix: None,
        }
    }
}

impl StatementFilter {
    pub fn matches(&self, description: &str, account_code: Option<&str>) -> bool {
        if let Some(prefix) = &self.account_prefix {
            match account_code {
                Some(code) if code.trim().starts_with(prefix.as_str()) => {}
                _ => return false,
            }
        }
        normalize_text(description).contains(&normalize_text(&self.description_contains))
    }
}

fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

// ============================================================================
// STATEMENT READERS
// ============================================================================

/// Reads the raw tables of one statement source.
///
/// Returns (entry name, table) pairs: a plain file yields one, an archive one
/// per delimited entry.
pub trait StatementReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<(String, RawTable)>>;
}

/// Plain `.csv` / `.txt` statement.
pub struct DelimitedStatementReader;

impl StatementReader for DelimitedStatementReader {
    fn read(&self, path: &Path) -> Result<Vec<(String, RawTable)>> {
        let table = RawTable::read_delimited(path)?;
        Ok(vec![(file_name(path), table)])
    }
}

/// `.zip` statement as published by the authority.
pub struct ArchiveStatementReader;

impl StatementReader for ArchiveStatementReader {
    fn read(&self, path: &Path) -> Result<Vec<(String, RawTable)>> {
        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)?;
        let mut tables = Vec::new();

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().to_string();
            let lower = name.to_lowercase();
            if entry.is_dir() || !(lower.ends_with(".csv") || lower.ends_with(".txt")) {
                debug!(archive = %path.display(), entry = %name, "skipping archive entry");
                continue;
            }

            let mut buf = Vec::with_capacity(entry_capacity(entry.size()));
            entry.read_to_end(&mut buf)?;
            tables.push((name, RawTable::from_bytes(&buf)?));
        }

        Ok(tables)
    }
}

/// Pick a reader by extension.
pub fn reader_for(path: &Path) -> Box<dyn StatementReader> {
    let is_zip = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);

    if is_zip {
        Box::new(ArchiveStatementReader)
    } else {
        Box::new(DelimitedStatementReader)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}

// ============================================================================
// PARSING
// ============================================================================

/// Result of parsing one statement.
#[derive(Debug, Clone)]
pub struct StatementReport {
    pub period: Period,
    pub lines_read: usize,
    pub lines_matched: usize,
    pub records: Vec<ExpenseRecord>,
    pub warnings: Vec<DataWarning>,
}

/// Extract expense records from one statement table.
///
/// Matching lines of the same operator are summed, so the output holds at
/// most one record per operator. Record order follows first appearance.
pub fn parse_statement_table(
    table: &RawTable,
    period: Period,
    filter: &StatementFilter,
    source: &str,
) -> Result<StatementReport> {
    let operator_col = CanonicalColumn::OperatorId.name();
    let missing = table.missing_columns(&[operator_col, DESCRIPTION, FINAL_BALANCE]);
    if !missing.is_empty() {
        return Err(EtlError::schema(&format!("statement {}", source), missing));
    }

    let mut records: Vec<ExpenseRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut warnings = Vec::new();
    let mut lines_matched = 0;

    for row in 0..table.len() {
        let description = table.get(row, DESCRIPTION).unwrap_or("");
        if !filter.matches(description, table.get(row, ACCOUNT_CODE)) {
            continue;
        }

        // +2: 1-indexed plus header row
        let line = row + 2;

        let Some(raw_id) = table.get(row, operator_col) else {
            warn!(source, line, "expense line without operator id dropped");
            warnings.push(DataWarning::RejectedRow {
                line,
                reason: "missing operator id".to_string(),
            });
            continue;
        };

        let raw_value = table.get(row, FINAL_BALANCE).unwrap_or("");
        let Some(value) = parse_decimal(raw_value) else {
            warn!(source, line, value = raw_value, "unparseable final balance dropped");
            warnings.push(DataWarning::UnparseableNumber {
                file: source.to_string(),
                line,
                value: raw_value.to_string(),
            });
            continue;
        };

        lines_matched += 1;
        let (operator_id, _) = columns::normalize_operator_id(raw_id);

        match index.get(&operator_id) {
            Some(&i) => records[i].value += value,
            None => {
                index.insert(operator_id.clone(), records.len());
                records.push(ExpenseRecord {
                    operator_id,
                    year: period.year,
                    quarter: period.quarter,
                    value,
                });
            }
        }
    }

    info!(
        source,
        period = %period,
        lines_read = table.len(),
        lines_matched,
        operators = records.len(),
        "statement parsed"
    );

    Ok(StatementReport {
        period,
        lines_read: table.len(),
        lines_matched,
        records,
        warnings,
    })
}

/// Parse one statement source (plain file or archive) for `period`.
pub fn parse_statement_file(
    path: &Path,
    period: Period,
    filter: &StatementFilter,
) -> Result<StatementReport> {
    let reader = reader_for(path);
    let tables = reader.read(path)?;
    if tables.is_empty() {
        return Err(EtlError::MissingInput(format!(
            "{} contains no delimited statement",
            path.display()
        )));
    }

    let mut merged = RawTable::concat(tables.iter().map(|(_, t)| t.clone()).collect());
    columns::reconcile_columns(&mut merged);

    parse_statement_table(&merged, period, filter, &file_name(path))
}

/// Statement sources in `dir` whose names carry a period, oldest first.
/// When both an archive and a plain file exist for a period, the archive wins.
pub fn find_statement_files(dir: &Path) -> Result<Vec<(Period, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut by_period: HashMap<Period, PathBuf> = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !matches!(ext.as_str(), "zip" | "csv" | "txt") {
            continue;
        }
        let Some(period) = Period::from_file_name(&path) else {
            continue;
        };

        let replace = match by_period.get(&period) {
            None => true,
            Some(existing) => ext == "zip" && existing.extension().and_then(|e| e.to_str()) != Some("zip"),
        };
        if replace {
            by_period.insert(period, path);
        }
    }

    let mut files: Vec<(Period, PathBuf)> = by_period.into_iter().collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Concatenate quarters into the intermediate expense table.
/// No dedup: each (operator, year, quarter) is already unique per statement.
pub fn expenses_table(records: &[ExpenseRecord]) -> RawTable {
    let mut table = RawTable::new(vec![
        CanonicalColumn::OperatorId.name().to_string(),
        YEAR.to_string(),
        QUARTER.to_string(),
        FINAL_BALANCE.to_string(),
    ]);

    for r in records {
        table.rows.push(vec![
            r.operator_id.clone(),
            r.year.to_string(),
            r.quarter.to_string(),
            format!("{:.2}", r.value),
        ]);
    }
    table
}

pub fn write_expenses(records: &[ExpenseRecord], path: &Path) -> Result<()> {
    expenses_table(records).write_delimited(path)?;
    info!(path = %path.display(), rows = records.len(), "expense table written");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
