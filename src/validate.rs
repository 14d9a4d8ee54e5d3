// ✅ Record Validation - quality checks over consolidated rows
//
// Invalid records are reported and logged, never removed: the consolidated
// table stays a faithful join of its inputs.

use crate::columns;
use crate::consolidate::ConsolidatedRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

// ============================================================================
// VALIDATION RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Value cannot be trusted
    Warning,  // Identity is incomplete or suspicious
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub rule_name: String,
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationResult {
    pub fn pass(rule_name: &str, field: &str) -> Self {
        ValidationResult {
            passed: true,
            rule_name: rule_name.to_string(),
            field: field.to_string(),
            message: String::new(),
            severity: Severity::Info,
        }
    }

    pub fn fail(rule_name: &str, field: &str, message: String, severity: Severity) -> Self {
        ValidationResult {
            passed: false,
            rule_name: rule_name.to_string(),
            field: field.to_string(),
            message,
            severity,
        }
    }
}

// ============================================================================
// QUALITY REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordIssue {
    /// Position in the consolidated table (0-based).
    pub index: usize,
    pub operator_id: String,
    pub result: ValidationResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub records_checked: usize,
    pub records_valid: usize,
    /// rule name → failures
    pub failures_by_rule: BTreeMap<String, usize>,
    pub issues: Vec<RecordIssue>,
}

impl QualityReport {
    pub fn summary(&self) -> String {
        format!(
            "Checked: {}, valid: {}, issues: {} ({} critical)",
            self.records_checked,
            self.records_valid,
            self.issues.len(),
            self.critical_count()
        )
    }

    pub fn critical_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.result.severity == Severity::Critical)
            .count()
    }

    pub fn failures(&self, rule_name: &str) -> usize {
        self.failures_by_rule.get(rule_name).copied().unwrap_or(0)
    }
}

// ============================================================================
// RULES
// ============================================================================

pub const RULE_TAX_ID: &str = "tax_id_check_digits";
pub const RULE_LEGAL_NAME: &str = "legal_name_present";
pub const RULE_POSITIVE_VALUE: &str = "value_positive";

const FIRST_WEIGHTS: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
const SECOND_WEIGHTS: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    match sum % 11 {
        0 | 1 => 0,
        r => 11 - r,
    }
}

/// True when `value` holds a CNPJ with valid check digits. Punctuation is
/// ignored; sequences of one repeated digit are rejected.
pub fn is_valid_cnpj(value: &str) -> bool {
    let digits: Vec<u32> = columns::digits_only(value)
        .chars()
        .filter_map(|c| c.to_digit(10))
        .collect();

    if digits.len() != 14 || digits.iter().all(|d| *d == digits[0]) {
        return false;
    }

    let first = check_digit(&digits[..12], &FIRST_WEIGHTS);
    let second = check_digit(&digits[..13], &SECOND_WEIGHTS);
    digits[12] == first && digits[13] == second
}

pub struct RecordValidator {
    /// Unmatched rows have no identity to check: skip instead of failing them.
    pub skip_unmatched_identity: bool,
}

impl Default for RecordValidator {
    fn default() -> Self {
        RecordValidator {
            skip_unmatched_identity: true,
        }
    }
}

impl RecordValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate_record(&self, record: &ConsolidatedRecord) -> Vec<ValidationResult> {
        let mut results = Vec::new();
        let unmatched = record.tax_id.is_none() && record.legal_name.is_none();

        if !(unmatched && self.skip_unmatched_identity) {
            results.push(self.validate_tax_id(record.tax_id.as_deref()));
            results.push(self.validate_legal_name(record.legal_name.as_deref()));
        }
        results.push(self.validate_value(record.value));

        results
    }

    fn validate_tax_id(&self, tax_id: Option<&str>) -> ValidationResult {
        match tax_id {
            Some(t) if is_valid_cnpj(t) => ValidationResult::pass(RULE_TAX_ID, "CNPJ"),
            Some(t) => ValidationResult::fail(
                RULE_TAX_ID,
                "CNPJ",
                format!("invalid check digits: {}", t),
                Severity::Warning,
            ),
            None => ValidationResult::fail(
                RULE_TAX_ID,
                "CNPJ",
                "missing".to_string(),
                Severity::Warning,
            ),
        }
    }

    fn validate_legal_name(&self, legal_name: Option<&str>) -> ValidationResult {
        match legal_name {
            Some(n) if !n.trim().is_empty() => ValidationResult::pass(RULE_LEGAL_NAME, "RAZAO_SOCIAL"),
            _ => ValidationResult::fail(
                RULE_LEGAL_NAME,
                "RAZAO_SOCIAL",
                "empty legal name".to_string(),
                Severity::Warning,
            ),
        }
    }

    fn validate_value(&self, value: f64) -> ValidationResult {
        if value.is_finite() && value > 0.0 {
            ValidationResult::pass(RULE_POSITIVE_VALUE, columns::FINAL_BALANCE)
        } else {
            ValidationResult::fail(
                RULE_POSITIVE_VALUE,
                columns::FINAL_BALANCE,
                format!("non-positive value: {}", value),
                Severity::Critical,
            )
        }
    }

    pub fn validate_all(&self, records: &[ConsolidatedRecord]) -> QualityReport {
        let mut report = QualityReport {
            records_checked: records.len(),
            ..QualityReport::default()
        };

        for (index, record) in records.iter().enumerate() {
            let mut valid = true;
            for result in self.validate_record(record) {
                if result.passed {
                    continue;
                }
                valid = false;
                *report
                    .failures_by_rule
                    .entry(result.rule_name.clone())
                    .or_insert(0) += 1;
                report.issues.push(RecordIssue {
                    index,
                    operator_id: record.operator_id.clone(),
                    result,
                });
            }
            if valid {
                report.records_valid += 1;
            }
        }

        for (rule, count) in &report.failures_by_rule {
            warn!(rule = %rule, failures = count, "validation rule failed");
        }
        info!(summary = %report.summary(), "validation finished");

        report
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tax_id: Option<&str>, name: Option<&str>, value: f64) -> ConsolidatedRecord {
        ConsolidatedRecord {
            operator_id: "1".to_string(),
            tax_id: tax_id.map(str::to_string),
            legal_name: name.map(str::to_string),
            year: 2023,
            quarter: 1,
            value,
        }
    }

    #[test]
    fn test_cnpj_check_digits() {
        assert!(is_valid_cnpj("11222333000181"));
        assert!(is_valid_cnpj("11.444.777/0001-61"));
        assert!(!is_valid_cnpj("11222333000182"));
        assert!(!is_valid_cnpj("11111111111111"));
        assert!(!is_valid_cnpj("123"));
    }

    #[test]
    fn test_valid_record_passes_every_rule() {
        let validator = RecordValidator::new();
        let results = validator.validate_record(&record(Some("11222333000181"), Some("ACME"), 10.0));

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.passed));
    }

    #[test]
    fn test_non_positive_value_is_critical() {
        let validator = RecordValidator::new();
        let results = validator.validate_record(&record(Some("11222333000181"), Some("ACME"), 0.0));
        let failed: Vec<_> = results.iter().filter(|r| !r.passed).collect();

        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].rule_name, RULE_POSITIVE_VALUE);
        assert_eq!(failed[0].severity, Severity::Critical);
    }

    #[test]
    fn test_unmatched_identity_is_skipped_by_default() {
        let validator = RecordValidator::new();
        assert_eq!(validator.validate_record(&record(None, None, 5.0)).len(), 1);

        let strict = RecordValidator {
            skip_unmatched_identity: false,
        };
        let failed = strict
            .validate_record(&record(None, None, 5.0))
            .into_iter()
            .filter(|r| !r.passed)
            .count();
        assert_eq!(failed, 2);
    }

    #[test]
    fn test_report_counts_per_rule() {
        let records = vec![
            record(Some("11222333000181"), Some("ACME"), 10.0),
            record(Some("11222333000182"), Some(" "), 10.0),
            record(Some("11222333000181"), Some("ACME"), -1.0),
        ];
        let report = RecordValidator::new().validate_all(&records);

        assert_eq!(report.records_checked, 3);
        assert_eq!(report.records_valid, 1);
        assert_eq!(report.failures(RULE_TAX_ID), 1);
        assert_eq!(report.failures(RULE_LEGAL_NAME), 1);
        assert_eq!(report.failures(RULE_POSITIVE_VALUE), 1);
        assert_eq!(report.critical_count(), 1);
        assert_eq!(report.issues[2].index, 2);
    }
}
