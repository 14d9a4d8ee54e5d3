// 🏷️ Column Reconciliation - canonical names for source spelling variants
//
// The authority has published the same registry under several header
// spellings. Each canonical column lists every spelling we have seen; the map
// is applied per file, before concatenation.

use crate::table::RawTable;
use serde::{Deserialize, Serialize};

// Column names of the expense tables (statement output / consolidation input)
pub const YEAR: &str = "ano";
pub const QUARTER: &str = "trimestre";
pub const FINAL_BALANCE: &str = "VL_SALDO_FINAL";

// Statement source columns
pub const DESCRIPTION: &str = "DESCRICAO";
pub const ACCOUNT_CODE: &str = "CD_CONTA_CONTABIL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalColumn {
    OperatorId,
    TaxId,
    LegalName,
    Modality,
    Region,
}

impl CanonicalColumn {
    pub const ALL: [CanonicalColumn; 5] = [
        CanonicalColumn::OperatorId,
        CanonicalColumn::TaxId,
        CanonicalColumn::LegalName,
        CanonicalColumn::Modality,
        CanonicalColumn::Region,
    ];

    /// Name used in every table after reconciliation.
    pub fn name(&self) -> &'static str {
        match self {
            CanonicalColumn::OperatorId => "REG_ANS",
            CanonicalColumn::TaxId => "CNPJ",
            CanonicalColumn::LegalName => "RAZAO_SOCIAL",
            CanonicalColumn::Modality => "MODALIDADE",
            CanonicalColumn::Region => "UF",
        }
    }

    /// Known spellings in source files (matched ignoring ASCII case).
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            CanonicalColumn::OperatorId => {
                &["REG_ANS", "Registro_ANS", "REGISTRO_OPERADORA", "RegistroANS"]
            }
            CanonicalColumn::TaxId => &["CNPJ"],
            CanonicalColumn::LegalName => &["RAZAO_SOCIAL", "Razao_Social"],
            CanonicalColumn::Modality => &["MODALIDADE", "Modalidade"],
            CanonicalColumn::Region => &["UF"],
        }
    }

    /// Canonical column for a raw header, if it is a known spelling.
    pub fn from_header(header: &str) -> Option<CanonicalColumn> {
        let header = header.trim().trim_start_matches('\u{feff}');
        Self::ALL.into_iter().find(|col| {
            col.aliases()
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(header))
        })
    }
}

/// One rename applied by [`reconcile_columns`].
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRename {
    pub from: String,
    pub to: CanonicalColumn,
}

/// Rename every known spelling in `table` to its canonical name.
/// Unrecognized columns are left as they are.
pub fn reconcile_columns(table: &mut RawTable) -> Vec<ColumnRename> {
    let mut renames = Vec::new();

    let headers = table.headers.clone();
    for header in headers {
        if let Some(canonical) = CanonicalColumn::from_header(&header) {
            if header != canonical.name() {
                table.rename_column(&header, canonical.name());
                renames.push(ColumnRename {
                    from: header,
                    to: canonical,
                });
            }
        }
    }

    renames
}

// ============================================================================
// VALUE NORMALIZATION
// ============================================================================

/// Keep ASCII digits only: "12.345.678/0001-99" → "12345678000199".
pub fn digits_only(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Tax ids are 14 digits. Shorter numeric ids lost their leading zeros
/// somewhere upstream and are padded back; empty input stays empty.
pub fn normalize_tax_id(value: &str) -> String {
    let digits = digits_only(value);
    if digits.is_empty() || digits.len() >= 14 {
        digits
    } else {
        format!("{:0>14}", digits)
    }
}

/// Join key form of an operator id.
///
/// Numeric ids are canonicalized ("000123" and "123" are the same operator).
/// Anything else is returned trimmed and flagged with `false` so callers can
/// count it.
pub fn normalize_operator_id(value: &str) -> (String, bool) {
    let trimmed = value.trim();
    // Spreadsheet exports sometimes carry "123.0"
    let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        let canonical = trimmed.trim_start_matches('0');
        let canonical = if canonical.is_empty() { "0" } else { canonical };
        (canonical.to_string(), true)
    } else {
        (trimmed.to_string(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_header_variants() {
        assert_eq!(
            CanonicalColumn::from_header("Registro_ANS"),
            Some(CanonicalColumn::OperatorId)
        );
        assert_eq!(
            CanonicalColumn::from_header("REGISTRO_OPERADORA"),
            Some(CanonicalColumn::OperatorId)
        );
        assert_eq!(
            CanonicalColumn::from_header("razao_social"),
            Some(CanonicalColumn::LegalName)
        );
        assert_eq!(
            CanonicalColumn::from_header(" CNPJ "),
            Some(CanonicalColumn::TaxId)
        );
        assert_eq!(CanonicalColumn::from_header("Nome_Fantasia"), None);
    }

    #[test]
    fn test_reconcile_renames_and_passes_through() {
        let mut table =
            RawTable::from_bytes(b"Registro_ANS;Razao_Social;CNPJ;Nome_Fantasia\n1;A;2;B\n")
                .unwrap();
        let renames = reconcile_columns(&mut table);

        assert_eq!(
            table.headers,
            vec!["REG_ANS", "RAZAO_SOCIAL", "CNPJ", "Nome_Fantasia"]
        );
        assert_eq!(renames.len(), 2);
        assert_eq!(table.get(0, "Nome_Fantasia"), Some("B"));
    }

    #[test]
    fn test_canonical_names() {
        assert_eq!(CanonicalColumn::OperatorId.name(), "REG_ANS");
        assert_eq!(CanonicalColumn::TaxId.name(), "CNPJ");
        assert_eq!(CanonicalColumn::LegalName.name(), "RAZAO_SOCIAL");
    }

    #[test]
    fn test_digits_only() {
        assert_eq!(digits_only("12.345.678/0001-99"), "12345678000199");
    }

    #[test]
    fn test_normalize_tax_id_pads() {
        assert_eq!(normalize_tax_id("1234567000199"), "01234567000199");
        assert_eq!(normalize_tax_id(""), "");
    }

    #[test]
    fn test_normalize_operator_id() {
        assert_eq!(normalize_operator_id(" 000123 "), ("123".to_string(), true));
        assert_eq!(normalize_operator_id("123.0"), ("123".to_string(), true));
        assert_eq!(normalize_operator_id("ABC1"), ("ABC1".to_string(), false));
    }
}
