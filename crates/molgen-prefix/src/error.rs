//! Typed errors for failures callers may want to match on.
//!
//! Everything else travels as `anyhow::Error` with context attached.

use thiserror::Error;

/// Geometry and wiring failures in the prefix path. These are fatal at startup.
#[derive(Debug, Error)]
pub enum PrefixError {
    #[error("d_model ({d_model}) must equal num_heads ({num_heads}) * head_dim ({head_dim})")]
    HeadGeometry {
        d_model: usize,
        num_heads: usize,
        head_dim: usize,
    },

    #[error("prefix sequence length must be positive")]
    EmptyPrefix,

    #[error("{path} embedding has {actual} positions, expected {expected}")]
    PrefixLength {
        path: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{path} projector emits width {actual}, expected {expected}")]
    ProjectorWidth {
        path: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("cannot reshape prefix tensor: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("prompt bundle has {actual} layers but the model has {expected}")]
    LayerCount { expected: usize, actual: usize },

    #[error("{path} prompt batch is {actual}, expected {expected}")]
    PromptBatch {
        path: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Failures of the molecular notation codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotationError {
    #[error("SMILES parse error at position {pos}: {message}")]
    SmilesParse { pos: usize, message: String },

    #[error("unclosed ring bond {0}")]
    UnclosedRing(u32),

    #[error("cannot kekulize aromatic system")]
    Kekulization,

    #[error("atom {index} ({symbol}) exceeds its valence")]
    Valence { index: usize, symbol: String },

    #[error("unsupported element '{0}'")]
    UnsupportedElement(String),

    #[error("malformed SELFIES symbol '{0}'")]
    SelfiesSymbol(String),

    #[error("SELFIES string is not well formed: {0}")]
    SelfiesSyntax(String),
}

/// Invalid run options, reported once at startup.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be positive, got {value}")]
    NotPositive { name: &'static str, value: f64 },

    #[error("{name} must lie in [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("min_len ({min_len}) exceeds max_len ({max_len})")]
    LengthOrder { min_len: usize, max_len: usize },

    #[error("beam search returns one sequence per beam: return_num ({return_num}) must equal beam ({beam})")]
    BeamReturnMismatch { beam: usize, return_num: usize },

    #[error("binding_affinity scoring requires {0}")]
    MissingDockingInput(&'static str),

    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}
