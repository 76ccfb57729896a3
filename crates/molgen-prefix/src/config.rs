//! Run configuration.
//!
//! A [`RunConfig`] is built once at startup (CLI flags layered over an
//! optional JSON file), validated, and then only borrowed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Decoding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerateMode {
    /// Diverse group beam search.
    #[default]
    Beam,
    /// Top-k / nucleus sampling.
    Topk,
}

/// Molecular property being optimised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    #[default]
    Plogp,
    Qed,
    BindingAffinity,
}

impl Property {
    /// Whether lower scores are better.
    pub fn minimises(&self) -> bool {
        matches!(self, Property::BindingAffinity)
    }

    /// Whether the input CSV carries a precomputed value for this property.
    pub fn has_input_column(&self) -> bool {
        matches!(self, Property::Plogp | Property::BindingAffinity)
    }
}

/// Which end-to-end flow to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Process {
    #[default]
    Generate,
    Preprocess,
}

macro_rules! str_enum {
    ($ty:ty, $kind:literal, { $($name:literal => $variant:path),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($name => Ok($variant),)+
                    _ => Err(ConfigError::UnknownVariant { kind: $kind, value: s.to_string() }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

str_enum!(GenerateMode, "generate mode", { "beam" => GenerateMode::Beam, "topk" => GenerateMode::Topk });
str_enum!(Property, "property", {
    "plogp" => Property::Plogp,
    "qed" => Property::Qed,
    "binding_affinity" => Property::BindingAffinity,
});
str_enum!(Process, "process", { "generate" => Process::Generate, "preprocess" => Process::Preprocess });

/// Every option of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    // data
    pub input_path: PathBuf,
    pub generate_path: PathBuf,
    pub output_path: PathBuf,
    pub finetune_path: PathBuf,
    pub dump_path: PathBuf,

    // model
    pub checkpoint_path: Option<PathBuf>,
    pub model_config_path: Option<PathBuf>,
    pub vocab_path: Option<PathBuf>,
    pub tokenizer_path: Option<PathBuf>,

    // scoring
    pub scorer_program: Option<PathBuf>,
    pub docking_binary: Option<PathBuf>,
    pub protein_path: Option<PathBuf>,

    // masking (logged only)
    pub mask_ratio: f64,
    pub poisson_lambda: f64,

    pub pad_to_multiple_of: usize,
    pub prefix_sequence_length: usize,
    pub mid_dim: usize,
    pub batch_size: usize,

    pub beam: usize,
    pub diversity_penalty: f32,
    pub max_len: usize,
    pub min_len: usize,
    pub length_penalty: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    pub return_num: usize,

    pub generate_mode: GenerateMode,
    pub property: Property,
    pub process: Process,

    pub random_seed: u64,
    pub num_workers: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("data/input.csv"),
            generate_path: PathBuf::from("data/generate.csv"),
            output_path: PathBuf::from("data/candidates.csv"),
            finetune_path: PathBuf::from("data/finetune.csv"),
            dump_path: PathBuf::from("dump"),
            checkpoint_path: None,
            model_config_path: None,
            vocab_path: None,
            tokenizer_path: None,
            scorer_program: None,
            docking_binary: None,
            protein_path: None,
            mask_ratio: 0.15,
            poisson_lambda: 3.0,
            pad_to_multiple_of: 8,
            prefix_sequence_length: 5,
            mid_dim: 512,
            batch_size: 8,
            beam: 5,
            diversity_penalty: 1.0,
            max_len: 128,
            min_len: 1,
            length_penalty: 1.0,
            top_k: 50,
            top_p: 1.0,
            temperature: 1.0,
            return_num: 5,
            generate_mode: GenerateMode::Beam,
            property: Property::Plogp,
            process: Process::Generate,
            random_seed: 42,
            num_workers: 4,
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { name, value })
    }
}

fn in_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { name, value, min, max })
    }
}

impl RunConfig {
    /// Reads a JSON config file. Absent fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {:?}", path))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse config {:?}", path))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        in_range("mask_ratio", self.mask_ratio, 0.0, 1.0)?;
        positive("poisson_lambda", self.poisson_lambda)?;
        positive("pad_to_multiple_of", self.pad_to_multiple_of as f64)?;
        positive("prefix_sequence_length", self.prefix_sequence_length as f64)?;
        positive("mid_dim", self.mid_dim as f64)?;
        positive("batch_size", self.batch_size as f64)?;
        positive("beam", self.beam as f64)?;
        positive("max_len", self.max_len as f64)?;
        positive("return_num", self.return_num as f64)?;
        positive("temperature", self.temperature as f64)?;
        positive("num_workers", self.num_workers as f64)?;
        in_range("top_p", self.top_p as f64, f64::MIN_POSITIVE, 1.0)?;
        if self.diversity_penalty < 0.0 {
            return Err(ConfigError::OutOfRange {
                name: "diversity_penalty",
                value: self.diversity_penalty as f64,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        if self.min_len > self.max_len {
            return Err(ConfigError::LengthOrder {
                min_len: self.min_len,
                max_len: self.max_len,
            });
        }
        if self.generate_mode == GenerateMode::Beam && self.return_num != self.beam {
            return Err(ConfigError::BeamReturnMismatch {
                beam: self.beam,
                return_num: self.return_num,
            });
        }
        if self.property == Property::BindingAffinity {
            if self.docking_binary.is_none() {
                return Err(ConfigError::MissingDockingInput("docking_binary"));
            }
            if self.protein_path.is_none() {
                return Err(ConfigError::MissingDockingInput("protein_path"));
            }
        }
        Ok(())
    }

    /// Sequences decoded per input row: the beam width or the sample count.
    pub fn sample_multiplier(&self) -> usize {
        match self.generate_mode {
            GenerateMode::Beam => self.beam,
            GenerateMode::Topk => self.return_num,
        }
    }

    /// Logs the effective configuration.
    pub fn log(&self) {
        log::info!(
            "process={} property={} mode={} batch_size={} return_num={}",
            self.process,
            self.property,
            self.generate_mode,
            self.batch_size,
            self.return_num
        );
        log::info!(
            "prefix: preseqlen={} mid_dim={}; decoding: max_len={} min_len={}",
            self.prefix_sequence_length,
            self.mid_dim,
            self.max_len,
            self.min_len
        );
        log::debug!(
            "masking: mask_ratio={} poisson_lambda={}",
            self.mask_ratio,
            self.poisson_lambda
        );
    }
}
