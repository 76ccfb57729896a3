use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

use molgen_prefix::{GenerateMode, Process, Property, RunConfig};

#[derive(Parser, Debug)]
#[command(name = "molgen")]
#[command(about = "Prefix-tuned BART molecule generation", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Generate candidates for every input molecule and report property statistics
    Generate(RunArgs),

    /// Generate and score candidates, then write fine-tuning data
    Preprocess(RunArgs),
}

impl Commands {
    pub fn process(&self) -> Process {
        match self {
            Commands::Generate(_) => Process::Generate,
            Commands::Preprocess(_) => Process::Preprocess,
        }
    }

    pub fn args(&self) -> &RunArgs {
        match self {
            Commands::Generate(args) | Commands::Preprocess(args) => args,
        }
    }

    /// The effective configuration: `--config` (or defaults), then flags.
    pub fn to_config(&self) -> Result<RunConfig> {
        let mut config = self.args().to_config()?;
        config.process = self.process();
        Ok(config)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    Beam,
    Topk,
}

impl From<ModeArg> for GenerateMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Beam => GenerateMode::Beam,
            ModeArg::Topk => GenerateMode::Topk,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum PropertyArg {
    Plogp,
    Qed,
    BindingAffinity,
}

impl From<PropertyArg> for Property {
    fn from(arg: PropertyArg) -> Self {
        match arg {
            PropertyArg::Plogp => Property::Plogp,
            PropertyArg::Qed => Property::Qed,
            PropertyArg::BindingAffinity => Property::BindingAffinity,
        }
    }
}

/// Options shared by both processes. Unset flags keep the value from
/// `--config` or the built-in default.
#[derive(Args, Debug, Default, Clone, PartialEq)]
pub struct RunArgs {
    /// JSON file with base values for every option
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Input CSV with a `smiles` column
    #[arg(short, long)]
    pub input_path: Option<PathBuf>,

    /// Generation table written by `generate`
    #[arg(long)]
    pub generate_path: Option<PathBuf>,

    /// Candidate SELFIES written by `preprocess`
    #[arg(short, long)]
    pub output_path: Option<PathBuf>,

    /// Fine-tuning table written by `preprocess`
    #[arg(long)]
    pub finetune_path: Option<PathBuf>,

    /// Directory shared by all ranks
    #[arg(long)]
    pub dump_path: Option<PathBuf>,

    /// Safetensors checkpoint holding base and prefix weights
    #[arg(long)]
    pub checkpoint_path: Option<PathBuf>,

    /// BART config.json
    #[arg(long)]
    pub model_config_path: Option<PathBuf>,

    /// SELFIES vocabulary (JSON array or one symbol per line)
    #[arg(long)]
    pub vocab_path: Option<PathBuf>,

    /// tokenizer.json, used instead of the vocabulary
    #[arg(long)]
    pub tokenizer_path: Option<PathBuf>,

    /// Program printing a property value: `<program> <property> <smiles>`
    #[arg(long)]
    pub scorer_program: Option<PathBuf>,

    /// Docking binary: `<binary> <protein> <smiles>`
    #[arg(long)]
    pub docking_binary: Option<PathBuf>,

    /// Receptor file passed to the docking binary
    #[arg(long)]
    pub protein_path: Option<PathBuf>,

    #[arg(long)]
    pub mask_ratio: Option<f64>,

    #[arg(long)]
    pub poisson_lambda: Option<f64>,

    #[arg(long)]
    pub pad_to_multiple_of: Option<usize>,

    /// Number of soft prompt positions
    #[arg(long)]
    pub prefix_sequence_length: Option<usize>,

    /// Hidden width of the prefix projector
    #[arg(long)]
    pub mid_dim: Option<usize>,

    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Beams (and beam groups) in beam mode
    #[arg(long)]
    pub beam: Option<usize>,

    #[arg(long)]
    pub diversity_penalty: Option<f32>,

    #[arg(long)]
    pub max_len: Option<usize>,

    #[arg(long)]
    pub min_len: Option<usize>,

    #[arg(long)]
    pub length_penalty: Option<f32>,

    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long)]
    pub top_p: Option<f32>,

    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Candidates per input molecule
    #[arg(short = 'n', long)]
    pub return_num: Option<usize>,

    #[arg(short = 'm', long, value_enum)]
    pub generate_mode: Option<ModeArg>,

    #[arg(short, long, value_enum)]
    pub property: Option<PropertyArg>,

    #[arg(long)]
    pub random_seed: Option<u64>,

    /// Workers for SMILES conversion and scoring
    #[arg(short = 'j', long)]
    pub num_workers: Option<usize>,
}

macro_rules! overlay {
    ($config:ident, $args:ident, $($field:ident),+ $(,)?) => {
        $(if let Some(value) = &$args.$field {
            $config.$field = value.clone().into();
        })+
    };
}

impl RunArgs {
    pub fn to_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path)?,
            None => RunConfig::default(),
        };
        overlay!(
            config,
            self,
            input_path,
            generate_path,
            output_path,
            finetune_path,
            dump_path,
            mask_ratio,
            poisson_lambda,
            pad_to_multiple_of,
            prefix_sequence_length,
            mid_dim,
            batch_size,
            beam,
            diversity_penalty,
            max_len,
            min_len,
            length_penalty,
            top_k,
            top_p,
            temperature,
            return_num,
            generate_mode,
            property,
            random_seed,
            num_workers,
        );
        for (slot, value) in [
            (&mut config.checkpoint_path, &self.checkpoint_path),
            (&mut config.model_config_path, &self.model_config_path),
            (&mut config.vocab_path, &self.vocab_path),
            (&mut config.tokenizer_path, &self.tokenizer_path),
            (&mut config.scorer_program, &self.scorer_program),
            (&mut config.docking_binary, &self.docking_binary),
            (&mut config.protein_path, &self.protein_path),
        ] {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        Ok(config)
    }
}
