// 📊 Aggregator - summary statistics over the consolidated table
//
// Everything here is derived and safe to recompute: totals, mean, top-5
// operators, top-5 regions, and the per-operator aggregate file.

use crate::consolidate::ConsolidatedRecord;
use crate::error::Result;
use crate::registry::OperatorRecord;
use crate::table::RawTable;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::path::Path;
use tracing::{debug, info};

pub const TOP_N: usize = 5;
pub const AGGREGATES_FILE: &str = "despesas_agregadas.csv";

// ============================================================================
// SUMMARY STATS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorTotal {
    pub operator_id: String,
    pub tax_id: Option<String>,
    pub legal_name: Option<String>,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionTotal {
    pub region: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub total_expenses: f64,
    pub mean_expense: f64,
    pub record_count: usize,
    pub top_operators: Vec<OperatorTotal>,
    pub top_regions: Vec<RegionTotal>,
}

/// operator id → region code, from the registry.
pub fn region_lookup(operators: &[OperatorRecord]) -> HashMap<String, String> {
    operators
        .iter()
        .filter_map(|op| op.region.clone().map(|uf| (op.operator_id.clone(), uf)))
        .collect()
}

/// Sum values per key, keeping keys in first-seen order.
fn sum_by_key<K, I>(items: I) -> Vec<(K, f64)>
where
    K: Eq + Hash + Clone,
    I: IntoIterator<Item = (K, f64)>,
{
    let mut order: Vec<(K, f64)> = Vec::new();
    let mut index: HashMap<K, usize> = HashMap::new();

    for (key, value) in items {
        match index.get(&key) {
            Some(&i) => order[i].1 += value,
            None => {
                index.insert(key.clone(), order.len());
                order.push((key, value));
            }
        }
    }
    order
}

/// Descending by total, stable, truncated to `n`: ties stay in first-seen order.
fn top_n<K>(mut sums: Vec<(K, f64)>, n: usize) -> Vec<(K, f64)> {
    sums.sort_by(|a, b| b.1.total_cmp(&a.1));
    sums.truncate(n);
    sums
}

/// Compute SummaryStats. Rows without a region are left out of the region
/// ranking only.
pub fn summarize(records: &[ConsolidatedRecord], regions: &HashMap<String, String>) -> SummaryStats {
    let total_expenses: f64 = records.iter().map(|r| r.value).sum();
    let mean_expense = if records.is_empty() {
        0.0
    } else {
        total_expenses / records.len() as f64
    };

    let by_operator = sum_by_key(records.iter().map(|r| (r.operator_id.as_str(), r.value)));

    // Identity of the first row seen per operator
    let mut identity: HashMap<&str, &ConsolidatedRecord> = HashMap::new();
    for r in records {
        identity.entry(r.operator_id.as_str()).or_insert(r);
    }

    let top_operators = top_n(by_operator, TOP_N)
        .into_iter()
        .map(|(id, total)| {
            let first = identity.get(id);
            OperatorTotal {
                operator_id: id.to_string(),
                tax_id: first.and_then(|r| r.tax_id.clone()),
                legal_name: first.and_then(|r| r.legal_name.clone()),
                total,
            }
        })
        .collect();

    let mut without_region = 0;
    let by_region = sum_by_key(records.iter().filter_map(|r| match regions.get(&r.operator_id) {
        Some(uf) => Some((uf.as_str(), r.value)),
        None => {
            without_region += 1;
            None
        }
    }));
    if without_region > 0 {
        debug!(rows = without_region, "rows without region left out of region ranking");
    }

    let top_regions = top_n(by_region, TOP_N)
        .into_iter()
        .map(|(region, total)| RegionTotal {
            region: region.to_string(),
            total,
        })
        .collect();

    SummaryStats {
        total_expenses,
        mean_expense,
        record_count: records.len(),
        top_operators,
        top_regions,
    }
}

// ============================================================================
// PER-OPERATOR AGGREGATES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAggregate {
    pub legal_name: String,
    pub region: String,
    pub total: f64,
    pub quarterly_mean: f64,
    /// Population standard deviation of the quarterly totals.
    pub std_dev: f64,
    pub quarters: usize,
}

/// Group by (legal name, region); statistics are taken over quarterly totals.
/// Unmatched operators are grouped under their operator id.
pub fn aggregate_by_operator(
    records: &[ConsolidatedRecord],
    regions: &HashMap<String, String>,
) -> Vec<OperatorAggregate> {
    let keyed = records.iter().map(|r| {
        let name = r
            .legal_name
            .clone()
            .unwrap_or_else(|| format!("REG_ANS {}", r.operator_id));
        let region = regions.get(&r.operator_id).cloned().unwrap_or_default();
        ((name, region, r.year, r.quarter), r.value)
    });
    let per_quarter = sum_by_key(keyed);

    let grouped = sum_by_key(
        per_quarter
            .iter()
            .map(|((name, region, _, _), v)| ((name.clone(), region.clone()), *v)),
    );

    let mut quarter_values: HashMap<(String, String), Vec<f64>> = HashMap::new();
    let mut seen_quarters: HashMap<(String, String), BTreeSet<(i32, u8)>> = HashMap::new();
    for ((name, region, year, quarter), value) in &per_quarter {
        let key = (name.clone(), region.clone());
        quarter_values.entry(key.clone()).or_default().push(*value);
        seen_quarters.entry(key).or_default().insert((*year, *quarter));
    }

    let mut aggregates: Vec<OperatorAggregate> = grouped
        .into_iter()
        .map(|(key, total)| {
            let values = quarter_values.get(&key).cloned().unwrap_or_default();
            let quarters = seen_quarters.get(&key).map(|s| s.len()).unwrap_or(0);
            let mean = if quarters == 0 { 0.0 } else { total / quarters as f64 };
            let variance = if values.is_empty() {
                0.0
            } else {
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
            };

            OperatorAggregate {
                legal_name: key.0,
                region: key.1,
                total,
                quarterly_mean: mean,
                std_dev: variance.sqrt(),
                quarters,
            }
        })
        .collect();

    aggregates.sort_by(|a, b| b.total.total_cmp(&a.total));
    aggregates
}

pub fn write_aggregates(aggregates: &[OperatorAggregate], path: &Path) -> Result<()> {
    let mut table = RawTable::new(
        [
            "RAZAO_SOCIAL",
            "UF",
            "total_despesas",
            "media_trimestral",
            "desvio_padrao",
            "trimestres",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect(),
    );

    for a in aggregates {
        table.rows.push(vec![
            a.legal_name.clone(),
            a.region.clone(),
            format!("{:.2}", a.total),
            format!("{:.2}", a.quarterly_mean),
            format!("{:.2}", a.std_dev),
            a.quarters.to_string(),
        ]);
    }

    table.write_delimited(path)?;
    info!(path = %path.display(), groups = aggregates.len(), "aggregate file written");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
