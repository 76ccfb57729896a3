//! Prefix-tuned BART for molecule generation and optimization
//!
//! Trainable soft prompts are projected into per-layer key/value prefixes
//! and injected into every attention site of a BART encoder-decoder, which
//! then decodes SELFIES candidates by diverse beam search or sampling.

pub mod activations;
pub mod config;
pub mod error;
pub mod generation;
pub mod linear_layer;
pub mod model;
pub mod molecule;
pub mod normalization;
pub mod parallel;
pub mod pipeline;
pub mod prefix;
pub mod runtime;
pub mod scoring;
pub mod tokenizer;
pub mod weights;

// Re-export commonly used items
pub use crate::{
    config::{GenerateMode, Process, Property, RunConfig},
    error::{ConfigError, NotationError, PrefixError},
    generation::{GenerationConfig, Seq2SeqGenerator},
    model::{BartConfig, PrefixBart, PromptConditionedModel},
    parallel::ParallelMap,
    pipeline::{run, GenerationEngine, Table},
    prefix::{BatchLayout, PrefixGeometry, PromptAssembler, PromptBundle},
    runtime::{ArtifactWriter, RankContext, Reporter},
    scoring::{Scorer, SCORE_SENTINEL},
    tokenizer::{SelfiesVocabTokenizer, SequenceTokenizer},
};
