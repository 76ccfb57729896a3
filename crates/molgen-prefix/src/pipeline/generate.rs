//! Prompted generation over an input table.

use anyhow::{anyhow, Context, Result};
use rand::Rng;

use super::dataset::Table;
use crate::config::RunConfig;
use crate::generation::{GenerationConfig, Seq2SeqGenerator};
use crate::model::{BartConfig, PrefixBart, PromptConditionedModel};
use crate::molecule::decode_or_empty;
use crate::parallel::ParallelMap;
use crate::prefix::{BatchLayout, PromptAssembler};
use crate::runtime::{ArtifactWriter, Reporter};
use crate::tokenizer::{HfTokenizer, PaddingOptions, SelfiesVocabTokenizer, SequenceTokenizer};
use crate::weights::{ParamStore, SafeTensorsLoader};

/// The prefix-conditioned model, its tokenizer and decoding settings.
pub struct GenerationEngine {
    model: PrefixBart,
    assembler: PromptAssembler,
    tokenizer: Box<dyn SequenceTokenizer>,
    generation: GenerationConfig,
    padding: PaddingOptions,
    batch_size: usize,
}

fn load_tokenizer(config: &RunConfig) -> Result<Box<dyn SequenceTokenizer>> {
    if let Some(path) = &config.tokenizer_path {
        return Ok(Box::new(HfTokenizer::from_file(path)?));
    }
    let path = config
        .vocab_path
        .as_ref()
        .ok_or_else(|| anyhow!("either tokenizer_path or vocab_path must be set"))?;
    Ok(Box::new(SelfiesVocabTokenizer::from_file(path)?))
}

impl GenerationEngine {
    /// Loads the tokenizer and builds the model and prefix from one checkpoint.
    /// Parameters absent from the checkpoint are initialised from `random_seed`.
    pub fn load(config: &RunConfig) -> Result<Self> {
        let tokenizer = load_tokenizer(config)?;
        let bart = match &config.model_config_path {
            Some(path) => BartConfig::from_json_file(path)?,
            None => BartConfig::default(),
        }
        .with_vocab_size(tokenizer.vocab_size());
        if bart.pad_token_id != tokenizer.pad_id() || bart.eos_token_id != tokenizer.eos_id() {
            log::warn!(
                "model special ids (pad={}, eos={}) differ from tokenizer (pad={}, eos={})",
                bart.pad_token_id,
                bart.eos_token_id,
                tokenizer.pad_id(),
                tokenizer.eos_id()
            );
        }

        let loader = match &config.checkpoint_path {
            Some(path) => Some(SafeTensorsLoader::new(path).context("failed to open checkpoint")?),
            None => {
                log::warn!("no checkpoint given, every parameter is randomly initialised");
                None
            }
        };
        let mut store = ParamStore::new(loader, config.random_seed);
        let geometry = bart.prefix_geometry(config.prefix_sequence_length, config.mid_dim)?;
        let assembler = PromptAssembler::from_store(&mut store, geometry)?;
        let model = PrefixBart::from_store(&mut store, bart)?;
        store.report().log();

        Self::new(model, assembler, tokenizer, config)
    }

    pub fn new(
        model: PrefixBart,
        assembler: PromptAssembler,
        tokenizer: Box<dyn SequenceTokenizer>,
        config: &RunConfig,
    ) -> Result<Self> {
        let generation = GenerationConfig::from_run_config(config, model.config());
        generation.validate()?;
        Ok(Self {
            model,
            assembler,
            tokenizer,
            generation,
            padding: PaddingOptions {
                max_len: config.max_len,
                pad_to_multiple_of: config.pad_to_multiple_of,
            },
            batch_size: config.batch_size.max(1),
        })
    }

    /// Candidates produced per input.
    pub fn return_num(&self) -> usize {
        self.generation.num_return_sequences()
    }

    /// Generates `return_num` SELFIES per input, input-major.
    ///
    /// A sequence that cannot be detokenized yields an empty string.
    pub fn generate_selfies<R: Rng + ?Sized>(
        &self,
        inputs: &[String],
        reporter: &dyn Reporter,
        rng: &mut R,
    ) -> Result<Vec<String>> {
        let generator = Seq2SeqGenerator::new(&self.model);
        let total = inputs.len().div_ceil(self.batch_size);
        let mut out = Vec::with_capacity(inputs.len() * self.return_num());

        for (step, chunk) in inputs.chunks(self.batch_size).enumerate() {
            reporter.progress("Generate", step, total);
            let batch = self.tokenizer.encode_batch(chunk, self.padding)?;
            let layout = BatchLayout::new(chunk.len(), self.generation.sample_multiplier());
            let prompts = self.assembler.assemble(layout)?;
            let sequences = generator
                .generate(&batch.input_ids, &batch.attention_mask, &prompts, &self.generation, rng)
                .with_context(|| format!("generation failed for batch {}", step))?;
            if sequences.len() != chunk.len() * self.return_num() {
                return Err(anyhow!(
                    "batch {} produced {} sequences, expected {}",
                    step,
                    sequences.len(),
                    chunk.len() * self.return_num()
                ));
            }
            out.extend(sequences.iter().map(|ids| {
                self.tokenizer.decode(ids).unwrap_or_else(|e| {
                    log::warn!("cannot detokenize generated sequence: {}", e);
                    String::new()
                })
            }));
        }
        Ok(out)
    }
}

fn repeat_each(values: &[String], times: usize) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| std::iter::repeat(v.clone()).take(times))
        .collect()
}

/// Generates candidates for every input row and writes the generation table
/// (`start_smiles`, optional `input_<property>`, `candidates`,
/// `candidate_smiles`) to `generate_path`.
pub fn generate_molecules<R: Rng + ?Sized>(
    engine: &GenerationEngine,
    input: &Table,
    config: &RunConfig,
    pool: &ParallelMap,
    writer: &ArtifactWriter,
    reporter: &dyn Reporter,
    rng: &mut R,
) -> Result<Table> {
    let candidates = engine.generate_selfies(input.column("selfies")?, reporter, rng)?;
    let candidate_smiles = pool.map(&candidates, |s| decode_or_empty(s));
    let failed = candidate_smiles.iter().filter(|s| s.is_empty()).count();
    if failed > 0 {
        log::warn!("{} of {} candidates did not decode to SMILES", failed, candidates.len());
    }

    let times = engine.return_num();
    let mut table = Table::new();
    table.set_column("start_smiles", repeat_each(input.column("smiles")?, times))?;
    if config.property.has_input_column() {
        let property = config.property.to_string();
        table.set_column(&format!("input_{}", property), repeat_each(input.column(&property)?, times))?;
    }
    table.set_column("candidates", candidates)?;
    table.set_column("candidate_smiles", candidate_smiles)?;
    table.save(&config.generate_path, writer)?;
    Ok(table)
}

/// Generates candidates for every input row and writes them alone, one
/// `candidates` column, to `output_path`.
pub fn generate_candidate_selfies<R: Rng + ?Sized>(
    engine: &GenerationEngine,
    input: &Table,
    config: &RunConfig,
    writer: &ArtifactWriter,
    reporter: &dyn Reporter,
    rng: &mut R,
) -> Result<Table> {
    let candidates = engine.generate_selfies(input.column("selfies")?, reporter, rng)?;
    let mut table = Table::new();
    table.set_column("candidates", candidates)?;
    reporter.info(&format!("saving candidates to {:?} ...", config.output_path));
    table.save(&config.output_path, writer)?;
    reporter.info("finish!");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::config::{GenerateMode, Property};
    use crate::runtime::SilentReporter;

    const SYMBOLS: [&str; 6] = ["[C]", "[O]", "[N]", "[=C]", "[Branch1]", "[Ring1]"];

    fn tiny_run(dir: &std::path::Path, mode: GenerateMode) -> RunConfig {
        let model_config = dir.join("config.json");
        std::fs::write(
            &model_config,
            r#"{"d_model": 8, "encoder_layers": 2, "decoder_layers": 2,
                "encoder_attention_heads": 2, "decoder_attention_heads": 2,
                "encoder_ffn_dim": 16, "decoder_ffn_dim": 16,
                "max_position_embeddings": 64}"#,
        )
        .unwrap();
        let vocab = dir.join("vocab.txt");
        std::fs::write(&vocab, SYMBOLS.join("\n")).unwrap();
        RunConfig {
            model_config_path: Some(model_config),
            vocab_path: Some(vocab),
            generate_path: dir.join("generate.csv"),
            output_path: dir.join("candidates.csv"),
            prefix_sequence_length: 2,
            mid_dim: 4,
            batch_size: 2,
            beam: 2,
            return_num: 2,
            max_len: 8,
            generate_mode: mode,
            ..RunConfig::default()
        }
    }

    fn input_table() -> Table {
        let mut table = Table::new();
        table
            .set_column("smiles", vec!["CC".into(), "CO".into(), "CN".into()])
            .unwrap();
        table
            .set_column("selfies", vec!["[C][C]".into(), "[C][O]".into(), "[C][N]".into()])
            .unwrap();
        table
            .set_column("plogp", vec!["0.5".into(), "1.0".into(), "-2".into()])
            .unwrap();
        table
    }

    #[test]
    fn test_engine_requires_a_vocabulary() {
        let config = RunConfig::default();
        assert!(GenerationEngine::load(&config).is_err());
    }

    #[test]
    fn test_generation_table_is_input_major() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_run(dir.path(), GenerateMode::Beam);
        let engine = GenerationEngine::load(&config).unwrap();
        let pool = ParallelMap::new(2).unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        let table = generate_molecules(
            &engine,
            &input_table(),
            &config,
            &pool,
            &ArtifactWriter::enabled(),
            &SilentReporter,
            &mut rng,
        )
        .unwrap();

        assert_eq!(table.len(), 6);
        assert_eq!(
            table.headers(),
            &["start_smiles", "input_plogp", "candidates", "candidate_smiles"].map(String::from)
        );
        assert_eq!(table.column("start_smiles").unwrap()[..3], ["CC", "CC", "CO"].map(String::from));
        assert_eq!(table.column("input_plogp").unwrap()[5], "-2");
        for selfies in table.column("candidates").unwrap() {
            assert!(!selfies.contains('<'), "special token leaked into {}", selfies);
        }
        assert_eq!(Table::read(&config.generate_path).unwrap().len(), 6);
    }

    #[test]
    fn test_malformed_input_row_does_not_abort_generation() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_run(dir.path(), GenerateMode::Beam);
        let engine = GenerationEngine::load(&config).unwrap();
        let inputs: Vec<String> = ["[C][O]", "[C] [O]", "CO"].map(String::from).to_vec();

        let candidates = engine
            .generate_selfies(&inputs, &SilentReporter, &mut StdRng::seed_from_u64(3))
            .unwrap();
        assert_eq!(candidates.len(), inputs.len() * engine.return_num());
    }

    #[test]
    fn test_sampling_is_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            return_num: 3,
            property: Property::Qed,
            ..tiny_run(dir.path(), GenerateMode::Topk)
        };
        let engine = GenerationEngine::load(&config).unwrap();
        let inputs = input_table().column("selfies").unwrap().to_vec();

        let first = engine
            .generate_selfies(&inputs, &SilentReporter, &mut StdRng::seed_from_u64(7))
            .unwrap();
        let second = engine
            .generate_selfies(&inputs, &SilentReporter, &mut StdRng::seed_from_u64(7))
            .unwrap();
        assert_eq!(first.len(), 9);
        assert_eq!(first, second);
    }

    #[test]
    fn test_candidate_file_has_single_column() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_run(dir.path(), GenerateMode::Topk);
        let engine = GenerationEngine::load(&config).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        generate_candidate_selfies(&engine, &input_table(), &config, &ArtifactWriter::enabled(), &SilentReporter, &mut rng)
            .unwrap();
        let written = Table::read(&config.output_path).unwrap();
        assert_eq!(written.headers(), &["candidates".to_string()]);
        assert_eq!(written.len(), 6);
    }
}
