//! Fine-tuning data: scored candidates grouped per input molecule.

use anyhow::{anyhow, Result};
use serde_json::json;

use super::dataset::Table;
use crate::config::{Property, RunConfig};
use crate::molecule::decode_or_empty;
use crate::parallel::ParallelMap;
use crate::runtime::{ArtifactWriter, Reporter};
use crate::scoring::{score_all, Scorer, SCORE_SENTINEL};

/// Distance below the worst valid score assigned to unscorable candidates.
pub const FAILED_SCORE_MARGIN: f64 = 2.0;

/// Orients scores so that larger is better: binding affinity is negated.
pub fn oriented_scores(property: Property, scores: &[Option<f64>]) -> Vec<Option<f64>> {
    scores
        .iter()
        .map(|s| if property.minimises() { s.map(|v| -v) } else { *s })
        .collect()
}

/// Replaces missing scores by `min(valid) - FAILED_SCORE_MARGIN`, or by the
/// sentinel when nothing scored.
pub fn fill_failed_scores(scores: &[Option<f64>]) -> Vec<f64> {
    let fill = match scores.iter().flatten().copied().min_by(|a, b| a.total_cmp(b)) {
        Some(worst) => worst - FAILED_SCORE_MARGIN,
        None => {
            log::warn!("no candidate could be scored");
            SCORE_SENTINEL
        }
    };
    scores.iter().map(|s| s.unwrap_or(fill)).collect()
}

/// One JSON list of `[selfies, score]` pairs per input.
pub fn candidate_groups(candidates: &[String], scores: &[f64], per_input: usize) -> Vec<String> {
    candidates
        .chunks(per_input)
        .zip(scores.chunks(per_input))
        .map(|(cands, props)| {
            let pairs: Vec<_> = cands.iter().zip(props).map(|(c, p)| json!([c, p])).collect();
            serde_json::Value::Array(pairs).to_string()
        })
        .collect()
}

/// Reads the candidate file, scores every candidate and writes the
/// fine-tuning table (`input`, `candidates`) to `finetune_path`.
pub fn build_finetune_data(
    input: &Table,
    config: &RunConfig,
    scorer: &dyn Scorer,
    pool: &ParallelMap,
    writer: &ArtifactWriter,
    reporter: &dyn Reporter,
) -> Result<Table> {
    let mut candidates = Table::read(&config.output_path)?;
    let sources = input.column("selfies")?;
    let per_input = config.return_num;
    if candidates.len() != sources.len() * per_input {
        return Err(anyhow!(
            "{:?} has {} candidates, expected {} x {}",
            config.output_path,
            candidates.len(),
            sources.len(),
            per_input
        ));
    }

    reporter.info("start calculate properties ...");
    let selfies = candidates.column("candidates")?.to_vec();
    let smiles = pool.map(&selfies, |s| decode_or_empty(s));
    candidates.set_column("candidate_smiles", smiles)?;
    let scores = score_all(scorer, candidates.column("candidate_smiles")?, pool);
    let scores = fill_failed_scores(&oriented_scores(config.property, &scores));

    let mut table = Table::new();
    table.set_column("input", sources.to_vec())?;
    table.set_column("candidates", candidate_groups(&selfies, &scores, per_input))?;
    reporter.info(&format!("saving data to {:?} ...", config.finetune_path));
    table.save(&config.finetune_path, writer)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_scores_fall_below_worst() {
        let filled = fill_failed_scores(&[Some(1.0), None, Some(-3.0)]);
        assert_eq!(filled, vec![1.0, -5.0, -3.0]);
        assert_eq!(fill_failed_scores(&[None, None]), vec![SCORE_SENTINEL; 2]);
    }

    #[test]
    fn test_binding_affinity_is_negated() {
        let oriented = oriented_scores(Property::BindingAffinity, &[Some(-7.5), None]);
        assert_eq!(oriented, vec![Some(7.5), None]);
        assert_eq!(oriented_scores(Property::Qed, &[Some(0.3)]), vec![Some(0.3)]);
    }

    #[test]
    fn test_candidate_groups_are_json_pairs() {
        let cands: Vec<String> = ["[C]", "[O]", "[N]", "[F]"].iter().map(|s| s.to_string()).collect();
        let groups = candidate_groups(&cands, &[1.0, 2.5, -1.0, 0.0], 2);
        assert_eq!(groups, vec![r#"[["[C]",1.0],["[O]",2.5]]"#, r#"[["[N]",-1.0],["[F]",0.0]]"#]);
    }

    #[cfg(unix)]
    #[test]
    fn test_build_finetune_data() {
        use crate::runtime::SilentReporter;
        use crate::scoring::test_util::length_scorer;
        use crate::scoring::CommandScorer;

        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            output_path: dir.path().join("candidates.csv"),
            finetune_path: dir.path().join("finetune.csv"),
            return_num: 2,
            property: Property::Qed,
            ..RunConfig::default()
        };
        std::fs::write(&config.output_path, "candidates\n[C][C]\n[C][O][C]\n[Branch1]\n[C]\n").unwrap();
        let mut input = Table::new();
        input.set_column("selfies", vec!["[C]".into(), "[O]".into()]).unwrap();

        let scorer = CommandScorer::new(length_scorer(dir.path()), Property::Qed);
        let pool = ParallelMap::new(2).unwrap();
        let table = build_finetune_data(&input, &config, &scorer, &pool, &ArtifactWriter::enabled(), &SilentReporter)
            .unwrap();

        let groups = table.column("candidates").unwrap();
        assert_eq!(groups[0], r#"[["[C][C]",2.0],["[C][O][C]",3.0]]"#);
        assert_eq!(groups[1], r#"[["[Branch1]",-1.0],["[C]",1.0]]"#);
        assert_eq!(Table::read(&config.finetune_path).unwrap().column("input").unwrap(), ["[C]", "[O]"].map(String::from));
    }
}
