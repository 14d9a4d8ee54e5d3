// 🚚 Pipeline - stage orchestration
//
// fetch → process → consolidate → aggregate → load. Every stage reads the
// previous stage's files from disk and writes its own, so any stage can be
// re-run alone. A failing stage aborts `run_all`.

use crate::aggregate::{self, SummaryStats, AGGREGATES_FILE};
use crate::config::PipelineConfig;
use crate::consolidate::{self, ConsolidationOutput, ConsolidationReport, CONSOLIDATED_FILE};
use crate::db::{self, LoadRun};
use crate::error::{DataWarning, EtlError, Result};
use crate::registry::{self, RegistrySet};
use crate::statement::{self, ExpenseRecord, Period};
use crate::table::RawTable;
use crate::validate::{QualityReport, RecordValidator};
use rusqlite::Connection;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

/// Intermediate table: statements of every quarter, concatenated.
pub const EXPENSES_FILE: &str = "despesas_por_operadora_trimestre.csv";

/// SummaryStats of the last aggregate run, as JSON.
pub const SUMMARY_FILE: &str = "resumo_estatisticas.json";

// ============================================================================
// STAGE REPORTS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub periods: Vec<Period>,
    pub lines_read: usize,
    pub lines_matched: usize,
    pub records: usize,
    pub warnings: usize,
    /// Statements that could not be read and were left out.
    pub skipped_files: Vec<DataWarning>,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ConsolidateStage {
    pub report: ConsolidationReport,
    pub output: ConsolidationOutput,
    pub quality: QualityReport,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub process: ProcessReport,
    pub consolidate: ConsolidateStage,
    pub summary: SummaryStats,
    pub load: LoadRun,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    pub config: PipelineConfig,
    pub run_id: Uuid,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline {
            config,
            run_id: Uuid::new_v4(),
        }
    }

    fn final_path(&self, name: &str) -> PathBuf {
        self.config.final_dir.join(name)
    }

    #[cfg(feature = "fetch")]
    pub fn fetch(&self) -> Result<crate::fetch::FetchReport> {
        use crate::fetch::{FetchReport, Fetcher, RegistrySource};
        use chrono::Datelike;

        let _span = info_span!("fetch", run_id = %self.run_id).entered();
        fs::create_dir_all(&self.config.raw_dir)?;

        let fetcher = Fetcher::new(&self.config.user_agent)?;
        let mut report = FetchReport::default();

        fetcher.fetch_statements(
            &self.config.statements_url,
            &self.config.raw_dir,
            self.config.quarters,
            chrono::Utc::now().year(),
            &mut report,
        )?;
        fetcher.fetch_registries(
            &RegistrySource::from_config(&self.config),
            &self.config.raw_dir,
            &mut report,
        );

        info!(
            statements = report.statements.len(),
            registries = report.registries.len(),
            downloaded = report.downloaded,
            skipped = report.skipped_existing,
            failed = report.failed_sources.len(),
            "fetch finished"
        );
        Ok(report)
    }

    /// Parse every statement in the raw dir into the intermediate table.
    pub fn process(&self) -> Result<ProcessReport> {
        let _span = info_span!("process", run_id = %self.run_id).entered();

        let files = statement::find_statement_files(&self.config.raw_dir)?;
        if files.is_empty() {
            return Err(EtlError::MissingInput(format!(
                "no statement files in {}",
                self.config.raw_dir.display()
            )));
        }

        let mut records: Vec<ExpenseRecord> = Vec::new();
        let mut periods = Vec::new();
        let mut lines_read = 0;
        let mut lines_matched = 0;
        let mut warnings = 0;
        let mut skipped_files = Vec::new();

        for (period, path) in &files {
            let report = match statement::parse_statement_file(path, *period, &self.config.filter) {
                Ok(report) => report,
                Err(e) => {
                    error!(file = %path.display(), error = %e, "failed to read statement file");
                    skipped_files.push(DataWarning::UnreadableFile {
                        file: path.display().to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            lines_read += report.lines_read;
            lines_matched += report.lines_matched;
            warnings += report.warnings.len();
            periods.push(report.period);
            records.extend(report.records);
        }

        if periods.is_empty() {
            return Err(EtlError::MissingInput(format!(
                "none of the {} statement files in {} could be read",
                files.len(),
                self.config.raw_dir.display()
            )));
        }

        if records.is_empty() {
            warn!(
                description = %self.config.filter.description_contains,
                "no statement line matched the expense filter"
            );
        }

        let output = self.final_path(EXPENSES_FILE);
        statement::write_expenses(&records, &output)?;

        Ok(ProcessReport {
            periods,
            lines_read,
            lines_matched,
            records: records.len(),
            warnings,
            skipped_files,
            output,
        })
    }

    pub fn load_registry(&self) -> Result<RegistrySet> {
        let files =
            registry::find_registry_files(&self.config.raw_dir, &self.config.registry_prefix)?;
        registry::load_registry(&files)
    }

    /// Join the intermediate table with the registry and write the
    /// consolidated file and archive.
    pub fn consolidate(&self) -> Result<ConsolidateStage> {
        let _span = info_span!("consolidate", run_id = %self.run_id).entered();

        let expenses_path = self.final_path(EXPENSES_FILE);
        if !expenses_path.exists() {
            return Err(EtlError::MissingInput(format!(
                "{} not found, run the process stage first",
                expenses_path.display()
            )));
        }
        let expenses = RawTable::read_delimited(&expenses_path)?;
        let registry = self.load_registry()?;

        let report = consolidate::consolidate(&expenses, &registry.table)?;
        let output = consolidate::write_outputs(&report.records, &self.config.final_dir)?;
        let quality = RecordValidator::new().validate_all(&report.records);

        Ok(ConsolidateStage {
            report,
            output,
            quality,
        })
    }

    fn read_consolidated(&self) -> Result<Vec<consolidate::ConsolidatedRecord>> {
        let path = self.final_path(CONSOLIDATED_FILE);
        if !path.exists() {
            return Err(EtlError::MissingInput(format!(
                "{} not found, run the consolidate stage first",
                path.display()
            )));
        }
        consolidate::read_consolidated(&path)
    }

    /// Summary statistics plus the per-operator aggregate file.
    pub fn aggregate(&self) -> Result<SummaryStats> {
        let _span = info_span!("aggregate", run_id = %self.run_id).entered();

        let records = self.read_consolidated()?;
        let regions = aggregate::region_lookup(&self.load_registry()?.operators());

        let summary = aggregate::summarize(&records, &regions);
        let aggregates = aggregate::aggregate_by_operator(&records, &regions);
        aggregate::write_aggregates(&aggregates, &self.final_path(AGGREGATES_FILE))?;

        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| EtlError::Internal(format!("summary serialization: {}", e)))?;
        fs::write(self.final_path(SUMMARY_FILE), json)?;

        info!(
            total = summary.total_expenses,
            mean = summary.mean_expense,
            records = summary.record_count,
            "summary computed"
        );
        Ok(summary)
    }

    /// Replace the store contents with the registry and consolidated table.
    pub fn load(&self) -> Result<LoadRun> {
        let _span = info_span!("load", run_id = %self.run_id).entered();

        let records = self.read_consolidated()?;
        let operators = self.load_registry()?.operators();
        let digest = consolidate::file_sha256(&self.final_path(CONSOLIDATED_FILE))?;

        if let Some(parent) = self.config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(&self.config.db_path)?;
        db::setup_database(&conn)?;

        let mut run = LoadRun::new(Some(digest));
        run.run_id = self.run_id.to_string();
        db::load_dataset(&mut conn, &operators, &records, run)
    }

    /// Every stage in order.
    pub fn run_all(&self) -> Result<RunSummary> {
        let _span = info_span!("run", run_id = %self.run_id).entered();
        info!("pipeline started");

        #[cfg(feature = "fetch")]
        self.fetch()?;

        let process = self.process()?;
        let consolidate = self.consolidate()?;
        let summary = self.aggregate()?;
        let load = self.load()?;

        info!(
            records = consolidate.output.rows,
            unmatched = consolidate.report.unmatched_rows,
            "pipeline finished"
        );
        Ok(RunSummary {
            run_id: self.run_id,
            process,
            consolidate,
            summary,
            load,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const STATEMENT: &str = "DATA;REG_ANS;CD_CONTA_CONTABIL;DESCRICAO;VL_SALDO_INICIAL;VL_SALDO_FINAL\n\
        2023-01-01;100;41;EVENTOS/ SINISTROS CONHECIDOS OU AVISADOS;0;1.000,50\n\
        2023-01-01;100;31;RECEITAS;0;99\n\
        2023-01-01;200;41;EVENTOS/ SINISTROS CONHECIDOS OU AVISADOS;0;250\n\
        2023-01-01;300;41;EVENTOS/ SINISTROS CONHECIDOS OU AVISADOS;0;10\n";

    const REGISTRY: &str = "Registro_ANS;CNPJ;Razao_Social;Modalidade;UF\n\
        100;11222333000181;ALFA SAUDE;Medicina de Grupo;SP\n\
        200;11444777000161;BETA SAUDE;Cooperativa Medica;RJ\n";

    fn pipeline(root: &Path) -> Pipeline {
        let raw = root.join("raw");
        fs::create_dir_all(&raw).unwrap();
        fs::write(raw.join("1T2023.csv"), STATEMENT).unwrap();
        fs::write(raw.join("Relatorio_cadop.csv"), REGISTRY).unwrap();

        let config = PipelineConfig {
            raw_dir: raw,
            final_dir: root.join("final"),
            db_path: root.join("db").join("ans.db"),
            ..PipelineConfig::default()
        };
        Pipeline::new(config)
    }

    #[test]
    fn test_process_writes_intermediate_table() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let report = p.process().unwrap();

        assert_eq!(report.records, 3);
        assert_eq!(report.periods, vec![Period { year: 2023, quarter: 1 }]);
        let table = RawTable::read_delimited(&report.output).unwrap();
        assert_eq!(table.get(0, "VL_SALDO_FINAL"), Some("1000.50"));
    }

    #[test]
    fn test_process_without_statements() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            raw_dir: dir.path().join("empty"),
            final_dir: dir.path().join("final"),
            ..PipelineConfig::default()
        };
        let err = Pipeline::new(config).process().unwrap_err();
        assert!(matches!(err, EtlError::MissingInput(_)));
    }

    #[test]
    fn test_process_skips_corrupt_statement() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        fs::write(p.config.raw_dir.join("2T2023.zip"), b"not a zip archive").unwrap();

        let report = p.process().unwrap();

        assert_eq!(report.periods, vec![Period { year: 2023, quarter: 1 }]);
        assert_eq!(report.records, 3);
        assert_eq!(report.skipped_files.len(), 1);
        assert!(matches!(
            &report.skipped_files[0],
            DataWarning::UnreadableFile { file, .. } if file.ends_with("2T2023.zip")
        ));
    }

    #[test]
    fn test_process_fails_when_no_statement_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        fs::write(raw.join("1T2023.zip"), b"truncated").unwrap();

        let config = PipelineConfig {
            raw_dir: raw,
            final_dir: dir.path().join("final"),
            ..PipelineConfig::default()
        };
        let err = Pipeline::new(config).process().unwrap_err();
        assert!(matches!(err, EtlError::MissingInput(_)));
    }

    #[test]
    fn test_consolidate_requires_process() {
        let dir = tempfile::tempdir().unwrap();
        let err = pipeline(dir.path()).consolidate().unwrap_err();
        assert!(matches!(err, EtlError::MissingInput(_)));
    }

    #[test]
    fn test_stages_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());

        p.process().unwrap();
        let stage = p.consolidate().unwrap();
        assert_eq!(stage.output.rows, 3);
        assert_eq!(stage.report.unmatched_rows, 1);
        assert!(stage.output.archive.exists());

        let summary = p.aggregate().unwrap();
        assert_eq!(summary.total_expenses, 1260.5);
        assert_eq!(summary.top_operators[0].operator_id, "100");
        assert_eq!(summary.top_regions[0].region, "SP");
        assert!(p.final_path(AGGREGATES_FILE).exists());
        assert!(p.final_path(SUMMARY_FILE).exists());

        let run = p.load().unwrap();
        assert_eq!(run.operators, 2);
        assert_eq!(run.expenses, 3);
        assert_eq!(run.run_id, p.run_id.to_string());

        let conn = db::open_read_only(&p.config.db_path).unwrap();
        assert_eq!(db::count_operators(&conn).unwrap(), 2);
        assert_eq!(db::expenses_for_tax_id(&conn, "11222333000181").unwrap().len(), 1);
    }
}
