//! Property statistics over a generation table.

use std::collections::BTreeMap;

use anyhow::Result;

use super::dataset::Table;
use crate::config::Property;
use crate::parallel::ParallelMap;
use crate::runtime::Reporter;
use crate::scoring::{from_sentinel, score_all, to_sentinel, Scorer};

/// Similarity thresholds at which improvement is reported.
pub const SIMILARITY_THRESHOLDS: [f64; 4] = [0.0, 0.2, 0.4, 0.6];

const TOP_N: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Improvement {
    pub threshold: f64,
    /// Mean best improvement over inputs that improved at all.
    pub mean: Option<f64>,
    pub improved_inputs: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PropertyStatistics {
    pub improvements: Vec<Improvement>,
    /// Best per-input values, best first.
    pub top_values: Vec<f64>,
    /// Every candidate reaching one of `top_values`.
    pub top_smiles: Vec<String>,
}

impl PropertyStatistics {
    pub fn report(&self, property: Property, reporter: &dyn Reporter) {
        for imp in &self.improvements {
            reporter.info(&format!("when sim>={}, improvement:", imp.threshold));
            match imp.mean {
                Some(mean) => reporter.info(&format!("{:.4} over {} inputs", mean, imp.improved_inputs)),
                None => reporter.info("no input improved"),
            }
        }
        let label = property.to_string().replace('_', " ");
        let best = if property.minimises() { "min" } else { "max" };
        reporter.info(&format!("top {} {} {}: {:?}", TOP_N, best, label, self.top_values));
        reporter.info(&format!("top {} {} {} smiles: {:?}", TOP_N, best, label, self.top_smiles));
    }
}

/// `output - input` (or `input - output` when minimising); zero for rows
/// whose output or input is missing.
fn row_improvement(property: Property, input: Option<f64>, output: Option<f64>) -> f64 {
    match (input, output) {
        (Some(i), Some(o)) if property.minimises() => i - o,
        (Some(i), Some(o)) => o - i,
        _ => 0.0,
    }
}

/// Best improvement per start molecule, averaged over molecules that improved.
pub fn improvement_at(
    property: Property,
    start: &[String],
    input: &[Option<f64>],
    output: &[Option<f64>],
    similarity: Option<&[Option<f64>]>,
    threshold: f64,
) -> Improvement {
    let mut best: BTreeMap<&str, f64> = BTreeMap::new();
    for row in 0..start.len() {
        let passes = similarity.map_or(true, |sim| sim[row].is_some_and(|s| s >= threshold));
        let value = if passes {
            row_improvement(property, input[row], output[row])
        } else {
            0.0
        };
        best.entry(start[row].as_str())
            .and_modify(|b| *b = b.max(value))
            .or_insert(value);
    }
    let improved: Vec<f64> = best.values().copied().filter(|&v| v != 0.0).collect();
    Improvement {
        threshold,
        mean: (!improved.is_empty()).then(|| improved.iter().sum::<f64>() / improved.len() as f64),
        improved_inputs: improved.len(),
    }
}

/// Top values of the per-input best outputs and the candidates reaching them.
pub fn top_candidates(
    property: Property,
    start: &[String],
    candidates: &[String],
    output: &[Option<f64>],
) -> (Vec<f64>, Vec<String>) {
    let better = |a: f64, b: f64| if property.minimises() { a.min(b) } else { a.max(b) };
    let mut best: BTreeMap<&str, f64> = BTreeMap::new();
    for (row, value) in output.iter().enumerate() {
        if let Some(v) = *value {
            best.entry(start[row].as_str())
                .and_modify(|b| *b = better(*b, v))
                .or_insert(v);
        }
    }
    let mut values: Vec<f64> = best.into_values().collect();
    if property.minimises() {
        values.sort_by(|a, b| a.total_cmp(b));
    } else {
        values.sort_by(|a, b| b.total_cmp(a));
    }
    values.truncate(TOP_N);

    let smiles = values
        .iter()
        .flat_map(move |target| {
            output
                .iter()
                .zip(candidates)
                .filter(move |(v, _)| **v == Some(*target))
                .map(|(_, s)| s.clone())
        })
        .collect();
    (values, smiles)
}

/// Scores the candidates (and, for QED, the start molecules), adds the
/// `output_<property>` / `input_<property>` columns and computes statistics.
pub fn compute_statistics(
    table: &mut Table,
    property: Property,
    scorer: &dyn Scorer,
    pool: &ParallelMap,
) -> Result<PropertyStatistics> {
    let start = table.column("start_smiles")?.to_vec();
    let candidates = table.column("candidate_smiles")?.to_vec();

    let output = score_all(scorer, &candidates, pool);
    let output_column: Vec<f64> = output.iter().map(|s| to_sentinel(*s)).collect();
    table.set_numeric_column(&format!("output_{}", property), &output_column)?;

    let input_name = format!("input_{}", property);
    let input: Vec<Option<f64>> = if property.has_input_column() {
        table
            .numeric_column(&input_name)?
            .into_iter()
            .map(|v| v.and_then(from_sentinel))
            .collect()
    } else {
        let scored = score_all(scorer, &start, pool);
        let column: Vec<f64> = scored.iter().map(|s| to_sentinel(*s)).collect();
        table.set_numeric_column(&input_name, &column)?;
        scored
    };

    let similarity = if table.has_column("sim") {
        Some(table.numeric_column("sim")?)
    } else {
        None
    };
    let improvements = match &similarity {
        Some(sim) => SIMILARITY_THRESHOLDS
            .iter()
            .map(|&t| improvement_at(property, &start, &input, &output, Some(sim.as_slice()), t))
            .collect(),
        None => vec![improvement_at(property, &start, &input, &output, None, 0.0)],
    };

    let (top_values, top_smiles) = top_candidates(property, &start, &candidates, &output);
    Ok(PropertyStatistics {
        improvements,
        top_values,
        top_smiles,
    })
}
