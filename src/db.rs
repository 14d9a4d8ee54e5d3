// 🗄️ Store - SQLite tables behind the query API
//
// The store is rebuilt from scratch on every load: both tables are replaced
// inside one transaction, so readers see either the previous batch or the new
// one. Every load is recorded in `load_runs`.

use crate::columns;
use crate::consolidate::ConsolidatedRecord;
use crate::error::Result;
use crate::registry::{OperatorRecord, OperatorStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS operators (
            operator_id TEXT PRIMARY KEY,
            tax_id TEXT NOT NULL,
            legal_name TEXT NOT NULL,
            legal_name_search TEXT NOT NULL DEFAULT '',
            modality TEXT,
            region TEXT,
            status TEXT NOT NULL
        )",
        [],
    )?;

    // Stores created before the search column existed
    let has_search_column = conn
        .prepare("SELECT 1 FROM pragma_table_info('operators') WHERE name = 'legal_name_search'")?
        .exists([])?;
    if !has_search_column {
        conn.execute(
            "ALTER TABLE operators ADD COLUMN legal_name_search TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS expenses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operator_id TEXT NOT NULL,
            tax_id TEXT,
            legal_name TEXT,
            year INTEGER NOT NULL,
            quarter INTEGER NOT NULL,
            value REAL NOT NULL
        )",
        [],
    )?;

    // Audit trail of loads
    conn.execute(
        "CREATE TABLE IF NOT EXISTS load_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT UNIQUE NOT NULL,
            loaded_at TEXT NOT NULL,
            operators INTEGER NOT NULL,
            expenses INTEGER NOT NULL,
            source_sha256 TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_operators_tax_id ON operators(tax_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_operators_legal_name ON operators(legal_name)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_operators_legal_name_search ON operators(legal_name_search)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expenses_tax_id ON expenses(tax_id)",
        [],
    )?;

    Ok(())
}

/// Open a connection for queries only. Fails when the database file does
/// not exist instead of creating an empty one.
pub fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.pragma_update(None, "query_only", true)?;
    Ok(conn)
}

pub fn ping(conn: &Connection) -> Result<()> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

// ============================================================================
// LOAD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRun {
    pub run_id: String,
    pub loaded_at: DateTime<Utc>,
    pub operators: usize,
    pub expenses: usize,
    /// Digest of the consolidated flat file the batch was read from.
    pub source_sha256: Option<String>,
}

impl LoadRun {
    pub fn new(source_sha256: Option<String>) -> Self {
        LoadRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            loaded_at: Utc::now(),
            operators: 0,
            expenses: 0,
            source_sha256,
        }
    }
}

/// Replace operators and expenses with a new batch, in one transaction.
/// Duplicate operator ids keep the first row.
pub fn load_dataset(
    conn: &mut Connection,
    operators: &[OperatorRecord],
    records: &[ConsolidatedRecord],
    mut run: LoadRun,
) -> Result<LoadRun> {
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM operators", [])?;
    tx.execute("DELETE FROM expenses", [])?;

    let mut operators_inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO operators (
                operator_id, tax_id, legal_name, legal_name_search, modality, region, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for op in operators {
            operators_inserted += stmt.execute(params![
                op.operator_id,
                op.tax_id,
                op.legal_name,
                search_key(&op.legal_name),
                op.modality,
                op.region,
                op.status.as_str(),
            ])?;
        }
    }

    {
        let mut stmt = tx.prepare(
            "INSERT INTO expenses (
                operator_id, tax_id, legal_name, year, quarter, value
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for r in records {
            stmt.execute(params![
                r.operator_id,
                r.tax_id,
                r.legal_name,
                r.year,
                r.quarter,
                r.value,
            ])?;
        }
    }

    run.operators = operators_inserted;
    run.expenses = records.len();
    tx.execute(
        "INSERT INTO load_runs (run_id, loaded_at, operators, expenses, source_sha256)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            run.run_id,
            run.loaded_at.to_rfc3339(),
            run.operators as i64,
            run.expenses as i64,
            run.source_sha256,
        ],
    )?;

    tx.commit()?;

    info!(
        run_id = %run.run_id,
        operators = run.operators,
        skipped_operators = operators.len() - operators_inserted,
        expenses = run.expenses,
        "store loaded"
    );
    Ok(run)
}

pub fn latest_load_run(conn: &Connection) -> Result<Option<LoadRun>> {
    let run = conn
        .query_row(
            "SELECT run_id, loaded_at, operators, expenses, source_sha256
             FROM load_runs ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                let loaded_at: String = row.get(1)?;
                let operators: i64 = row.get(2)?;
                let expenses: i64 = row.get(3)?;
                Ok(LoadRun {
                    run_id: row.get(0)?,
                    loaded_at: DateTime::parse_from_rfc3339(&loaded_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                1,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?,
                    operators: operators as usize,
                    expenses: expenses as usize,
                    source_sha256: row.get(4)?,
                })
            },
        )
        .optional()?;

    Ok(run)
}

// ============================================================================
// QUERIES
// ============================================================================

fn operator_from_row(row: &Row) -> rusqlite::Result<OperatorRecord> {
    let status: String = row.get(5)?;
    Ok(OperatorRecord {
        operator_id: row.get(0)?,
        tax_id: row.get(1)?,
        legal_name: row.get(2)?,
        modality: row.get(3)?,
        region: row.get(4)?,
        status: OperatorStatus::parse(&status).unwrap_or(OperatorStatus::Active),
    })
}

fn expense_from_row(row: &Row) -> rusqlite::Result<ConsolidatedRecord> {
    Ok(ConsolidatedRecord {
        operator_id: row.get(0)?,
        tax_id: row.get(1)?,
        legal_name: row.get(2)?,
        year: row.get(3)?,
        quarter: row.get(4)?,
        value: row.get(5)?,
    })
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Case-folded legal name. SQLite's `lower()` only folds ASCII, so the
/// key is computed here and stored next to the name.
fn search_key(legal_name: &str) -> String {
    legal_name.to_lowercase()
}

/// True for queries that read as a (partial) CNPJ: digits plus its
/// punctuation.
fn is_tax_id_query(q: &str) -> bool {
    q.chars().any(|c| c.is_ascii_digit())
        && q
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '/' | '-') || c.is_whitespace())
}

/// LIKE patterns for the operator search: legal name (case-insensitive)
/// and tax id (digits of the query, so "12.345" finds "12345...").
fn search_patterns(q: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(q) = q.map(str::trim).filter(|q| !q.is_empty()) else {
        return (None, None);
    };

    let name = format!("%{}%", escape_like(&search_key(q)));
    let tax = is_tax_id_query(q).then(|| format!("%{}%", columns::digits_only(q)));
    (Some(name), tax)
}

const OPERATOR_FILTER: &str = "(?1 IS NULL
        OR legal_name_search LIKE ?1 ESCAPE '\\'
        OR (?2 IS NOT NULL AND tax_id LIKE ?2))";

/// One page of operators (1-based `page`) and the total matching `q`.
pub fn list_operators(
    conn: &Connection,
    page: u32,
    limit: u32,
    q: Option<&str>,
) -> Result<(Vec<OperatorRecord>, u64)> {
    let (name_pattern, tax_pattern) = search_patterns(q);
    let offset = (page.max(1) as i64 - 1) * limit as i64;

    let mut stmt = conn.prepare(&format!(
        "SELECT operator_id, tax_id, legal_name, modality, region, status
         FROM operators
         WHERE {}
         ORDER BY legal_name, operator_id
         LIMIT ?3 OFFSET ?4",
        OPERATOR_FILTER
    ))?;

    let operators = stmt
        .query_map(
            params![name_pattern, tax_pattern, limit as i64, offset],
            operator_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM operators WHERE {}", OPERATOR_FILTER),
        params![name_pattern, tax_pattern],
        |row| row.get(0),
    )?;

    debug!(page, limit, returned = operators.len(), total, "operators listed");
    Ok((operators, total as u64))
}

pub fn count_operators(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM operators", [], |row| row.get(0))?;
    Ok(count as u64)
}

/// Lookup by tax id in any format ("12.345.678/0001-99" or digits).
pub fn find_operator_by_tax_id(conn: &Connection, tax_id: &str) -> Result<Option<OperatorRecord>> {
    let tax_id = columns::normalize_tax_id(tax_id);
    if tax_id.is_empty() {
        return Ok(None);
    }

    let operator = conn
        .query_row(
            "SELECT operator_id, tax_id, legal_name, modality, region, status
             FROM operators WHERE tax_id = ?1
             ORDER BY operator_id LIMIT 1",
            params![tax_id],
            operator_from_row,
        )
        .optional()?;

    Ok(operator)
}

/// Expense history of one operator, oldest period first.
pub fn expenses_for_tax_id(conn: &Connection, tax_id: &str) -> Result<Vec<ConsolidatedRecord>> {
    let tax_id = columns::normalize_tax_id(tax_id);

    let mut stmt = conn.prepare(
        "SELECT operator_id, tax_id, legal_name, year, quarter, value
         FROM expenses WHERE tax_id = ?1
         ORDER BY year, quarter, id",
    )?;

    let expenses = stmt
        .query_map(params![tax_id], expense_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(expenses)
}

/// Full consolidated table in load order (which is the consolidated sort).
pub fn load_consolidated(conn: &Connection) -> Result<Vec<ConsolidatedRecord>> {
    let mut stmt = conn.prepare(
        "SELECT operator_id, tax_id, legal_name, year, quarter, value
         FROM expenses ORDER BY id",
    )?;

    let expenses = stmt
        .query_map([], expense_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(expenses)
}

/// operator id → region for operators that have one.
pub fn region_map(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare(
        "SELECT operator_id, region FROM operators
         WHERE region IS NOT NULL AND region != ''",
    )?;

    let regions = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<HashMap<String, String>>>()?;

    Ok(regions)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn operator(id: &str, tax_id: &str, name: &str, region: Option<&str>) -> OperatorRecord {
        OperatorRecord {
            operator_id: id.to_string(),
            tax_id: tax_id.to_string(),
            legal_name: name.to_string(),
            modality: Some("Cooperativa Médica".to_string()),
            region: region.map(str::to_string),
            status: OperatorStatus::Active,
        }
    }

    fn expense(id: &str, tax_id: Option<&str>, year: i32, quarter: u8, value: f64) -> ConsolidatedRecord {
        ConsolidatedRecord {
            operator_id: id.to_string(),
            tax_id: tax_id.map(str::to_string),
            legal_name: tax_id.map(|_| format!("OP {}", id)),
            year,
            quarter,
            value,
        }
    }

    fn seeded() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let operators = vec![
            operator("1", "12345678000199", "ALFA SAUDE", Some("SP")),
            operator("2", "11222333000181", "BETA ODONTO", Some("RJ")),
            operator("3", "11444777000161", "GAMA 100% SAUDE", None),
        ];
        let records = vec![
            expense("1", Some("12345678000199"), 2023, 2, 50.0),
            expense("1", Some("12345678000199"), 2023, 1, 20.0),
            expense("9", None, 2023, 1, 5.0),
        ];
        load_dataset(&mut conn, &operators, &records, LoadRun::new(None)).unwrap();
        conn
    }

    #[test]
    fn test_load_and_count() {
        let conn = seeded();
        assert_eq!(count_operators(&conn).unwrap(), 3);
        assert_eq!(load_consolidated(&conn).unwrap().len(), 3);
    }

    #[test]
    fn test_load_replaces_previous_batch() {
        let mut conn = seeded();
        let operators = vec![operator("7", "1", "ONLY", None)];
        let run = load_dataset(&mut conn, &operators, &[], LoadRun::new(Some("abc".into()))).unwrap();

        assert_eq!(count_operators(&conn).unwrap(), 1);
        assert!(load_consolidated(&conn).unwrap().is_empty());

        let latest = latest_load_run(&conn).unwrap().unwrap();
        assert_eq!(latest.run_id, run.run_id);
        assert_eq!(latest.operators, 1);
        assert_eq!(latest.source_sha256.as_deref(), Some("abc"));
    }

    #[test]
    fn test_duplicate_operator_keeps_first() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let operators = vec![
            operator("1", "1", "FIRST", None),
            operator("1", "2", "SECOND", None),
        ];
        let run = load_dataset(&mut conn, &operators, &[], LoadRun::new(None)).unwrap();

        assert_eq!(run.operators, 1);
        let (page, _) = list_operators(&conn, 1, 10, None).unwrap();
        assert_eq!(page[0].legal_name, "FIRST");
    }

    #[test]
    fn test_list_operators_pagination() {
        let conn = seeded();
        let (page1, total) = list_operators(&conn, 1, 2, None).unwrap();
        let (page2, _) = list_operators(&conn, 2, 2, None).unwrap();
        let (page3, _) = list_operators(&conn, 3, 2, None).unwrap();

        assert_eq!(total, 3);
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].legal_name, "ALFA SAUDE");
        assert_eq!(page2.len(), 1);
        assert!(page3.is_empty());
    }

    #[test]
    fn test_list_operators_filter() {
        let conn = seeded();

        let (by_name, total) = list_operators(&conn, 1, 10, Some("odonto")).unwrap();
        assert_eq!(total, 1);
        assert_eq!(by_name[0].operator_id, "2");

        let (by_tax, _) = list_operators(&conn, 1, 10, Some("11.444")).unwrap();
        assert_eq!(by_tax[0].operator_id, "3");

        // '%' is matched literally
        let (literal, total) = list_operators(&conn, 1, 10, Some("100%")).unwrap();
        assert_eq!(total, 1);
        assert_eq!(literal[0].operator_id, "3");

        let (_, blank_total) = list_operators(&conn, 1, 10, Some("  ")).unwrap();
        assert_eq!(blank_total, 3);
    }

    #[test]
    fn test_list_operators_filter_folds_accented_names() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let operators = vec![
            operator("1", "12345678000199", "UNIMED SAÚDE", Some("SP")),
            operator("2", "11222333000181", "ASSISTÊNCIA MÉDICA", Some("RJ")),
        ];
        load_dataset(&mut conn, &operators, &[], LoadRun::new(None)).unwrap();

        for q in ["saúde", "SAÚDE", "Saúde"] {
            let (found, total) = list_operators(&conn, 1, 10, Some(q)).unwrap();
            assert_eq!(total, 1, "query {q}");
            assert_eq!(found[0].operator_id, "1");
        }

        let (found, _) = list_operators(&conn, 1, 10, Some("médica")).unwrap();
        assert_eq!(found[0].legal_name, "ASSISTÊNCIA MÉDICA");
    }

    #[test]
    fn test_list_operators_name_with_digit_skips_tax_match() {
        let conn = seeded();

        let (_, total) = list_operators(&conn, 1, 10, Some("BETA 1")).unwrap();
        assert_eq!(total, 0);

        let (found, total) = list_operators(&conn, 1, 10, Some("11.222.333/0001-81")).unwrap();
        assert_eq!(total, 1);
        assert_eq!(found[0].operator_id, "2");
    }

    #[test]
    fn test_is_tax_id_query() {
        assert!(is_tax_id_query("11.444"));
        assert!(is_tax_id_query("12.345.678/0001-99"));
        assert!(is_tax_id_query("123 456"));
        assert!(!is_tax_id_query("BETA 1"));
        assert!(!is_tax_id_query("./-"));
    }

    #[test]
    fn test_setup_database_adds_search_column_to_old_store() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE operators (
                operator_id TEXT PRIMARY KEY,
                tax_id TEXT NOT NULL,
                legal_name TEXT NOT NULL,
                modality TEXT,
                region TEXT,
                status TEXT NOT NULL
            )",
            [],
        )
        .unwrap();

        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();

        let (_, total) = list_operators(&conn, 1, 10, Some("x")).unwrap();
        assert_eq!(total, 0);
    }

    #[test]
    fn test_latest_load_run_rejects_bad_timestamp() {
        let conn = seeded();
        conn.execute("UPDATE load_runs SET loaded_at = 'yesterday'", [])
            .unwrap();
        assert!(latest_load_run(&conn).is_err());
    }

    #[test]
    fn test_find_operator_by_formatted_tax_id() {
        let conn = seeded();
        let found = find_operator_by_tax_id(&conn, "12.345.678/0001-99").unwrap();
        assert_eq!(found.map(|o| o.operator_id), Some("1".to_string()));

        assert!(find_operator_by_tax_id(&conn, "00000000000000").unwrap().is_none());
        assert!(find_operator_by_tax_id(&conn, "abc").unwrap().is_none());
    }

    #[test]
    fn test_expenses_for_tax_id_ordered() {
        let conn = seeded();
        let expenses = expenses_for_tax_id(&conn, "12345678000199").unwrap();

        assert_eq!(expenses.len(), 2);
        assert_eq!(expenses[0].quarter, 1);
        assert_eq!(expenses[1].quarter, 2);
        assert!(expenses_for_tax_id(&conn, "11222333000181").unwrap().is_empty());
    }

    #[test]
    fn test_region_map_skips_missing() {
        let conn = seeded();
        let regions = region_map(&conn).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions.get("1").map(String::as_str), Some("SP"));
    }

    #[test]
    fn test_open_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ans.db");
        assert!(open_read_only(&path).is_err());

        {
            let conn = Connection::open(&path).unwrap();
            setup_database(&conn).unwrap();
        }

        let conn = open_read_only(&path).unwrap();
        ping(&conn).unwrap();
        assert!(conn.execute("DELETE FROM operators", []).is_err());
    }
}
