//! End-to-end processes over CSV files.
//!
//! `generate` writes one row per candidate and then scores and summarises
//! them; `preprocess` writes bare candidates, scores them and groups them
//! per input as fine-tuning data. Both run identically on every rank; the
//! rank only decides who reports and who writes.

mod dataset;
mod generate;
mod preprocess;
mod statistics;

pub use dataset::{load_input, Table};
pub use generate::{generate_candidate_selfies, generate_molecules, GenerationEngine};
pub use preprocess::{build_finetune_data, candidate_groups, fill_failed_scores, oriented_scores, FAILED_SCORE_MARGIN};
pub use statistics::{
    compute_statistics, improvement_at, top_candidates, Improvement, PropertyStatistics, SIMILARITY_THRESHOLDS,
};

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{Process, RunConfig};
use crate::parallel::ParallelMap;
use crate::runtime::{reporter_for, ArtifactWriter, FileBarrier, RankContext};
use crate::scoring::build_scorer;

/// Runs the configured process and waits for every rank before returning.
pub fn run(config: &RunConfig, ctx: &RankContext) -> Result<()> {
    config.validate()?;
    config.log();
    let reporter = reporter_for(ctx);
    let writer = ArtifactWriter::for_rank(ctx);
    let barrier = FileBarrier::open(&config.dump_path, *ctx)?;
    let pool = ParallelMap::new(config.num_workers)?;
    let scorer = build_scorer(config)?;
    let mut rng = StdRng::seed_from_u64(config.random_seed);

    let input = load_input(&config.input_path, &pool, &writer, reporter.as_ref())?;
    let engine = GenerationEngine::load(config)?;
    reporter.info(&format!("start generating with {} ...", config.generate_mode));

    match config.process {
        Process::Generate => {
            let mut table =
                generate_molecules(&engine, &input, config, &pool, &writer, reporter.as_ref(), &mut rng)?;
            let stats = compute_statistics(&mut table, config.property, scorer.as_ref(), &pool)?;
            table.save(&config.generate_path, &writer)?;
            stats.report(config.property, reporter.as_ref());
        }
        Process::Preprocess => {
            generate_candidate_selfies(&engine, &input, config, &writer, reporter.as_ref(), &mut rng)?;
            // only the primary wrote the candidate file
            barrier.wait("candidates")?;
            build_finetune_data(&input, config, scorer.as_ref(), &pool, &writer, reporter.as_ref())?;
        }
    }

    barrier.wait("teardown")?;
    reporter.info("finish!");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::{GenerateMode, Property};
    use crate::scoring::test_util::length_scorer;

    fn workspace(dir: &Path, process: Process) -> RunConfig {
        std::fs::write(dir.join("input.csv"), "smiles,plogp\nCCO,0.5\nc1ccccc1,1.0\n").unwrap();
        std::fs::write(dir.join("vocab.txt"), "[C]\n[O]\n[=C]\n[Ring1]\n[=Branch1]\n").unwrap();
        std::fs::write(
            dir.join("config.json"),
            r#"{"d_model": 8, "encoder_layers": 1, "decoder_layers": 1,
                "encoder_attention_heads": 2, "decoder_attention_heads": 2,
                "encoder_ffn_dim": 8, "decoder_ffn_dim": 8,
                "max_position_embeddings": 64}"#,
        )
        .unwrap();
        RunConfig {
            input_path: dir.join("input.csv"),
            generate_path: dir.join("out/generate.csv"),
            output_path: dir.join("out/candidates.csv"),
            finetune_path: dir.join("out/finetune.csv"),
            dump_path: dir.join("dump"),
            model_config_path: Some(dir.join("config.json")),
            vocab_path: Some(dir.join("vocab.txt")),
            scorer_program: Some(length_scorer(dir)),
            prefix_sequence_length: 2,
            mid_dim: 4,
            batch_size: 1,
            return_num: 2,
            max_len: 6,
            generate_mode: GenerateMode::Topk,
            property: Property::Plogp,
            process,
            num_workers: 2,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_generate_process_writes_scored_table() {
        let dir = tempfile::tempdir().unwrap();
        let config = workspace(dir.path(), Process::Generate);
        run(&config, &RankContext::single()).unwrap();

        let input = Table::read(&config.input_path).unwrap();
        assert!(input.has_column("selfies"));

        let table = Table::read(&config.generate_path).unwrap();
        assert_eq!(table.len(), 4);
        assert!(table.has_column("output_plogp"));
        let outputs = table.numeric_column("output_plogp").unwrap();
        let smiles = table.column("candidate_smiles").unwrap();
        for (score, smi) in outputs.iter().zip(smiles) {
            let expected = if smi.is_empty() { -100.0 } else { smi.len() as f64 };
            assert_eq!(*score, Some(expected));
        }
    }

    #[test]
    fn test_preprocess_process_writes_finetune_table() {
        let dir = tempfile::tempdir().unwrap();
        let config = workspace(dir.path(), Process::Preprocess);
        run(&config, &RankContext::single()).unwrap();

        assert_eq!(Table::read(&config.output_path).unwrap().len(), 4);
        let finetune = Table::read(&config.finetune_path).unwrap();
        assert_eq!(finetune.headers(), &["input".to_string(), "candidates".to_string()]);
        for group in finetune.column("candidates").unwrap() {
            let pairs: Vec<(String, f64)> = serde_json::from_str(group).unwrap();
            assert_eq!(pairs.len(), 2);
        }
    }

    #[test]
    fn test_invalid_config_is_rejected_before_work() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            batch_size: 0,
            ..workspace(dir.path(), Process::Generate)
        };
        assert!(run(&config, &RankContext::single()).is_err());
        assert!(!config.generate_path.exists());
    }
}
