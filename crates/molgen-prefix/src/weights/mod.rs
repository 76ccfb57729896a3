//! Checkpoint loading.
//!
//! Checkpoints are `.safetensors` blobs. Loading is non-strict: tensors whose
//! names match a parameter of the current architecture are loaded, parameters
//! absent from the checkpoint are initialised, and checkpoint entries nobody
//! asked for are reported as unexpected. This lets the prefix modules evolve
//! independently of the frozen base model's parameter set.

mod param_store;
mod safetensors_loader;

pub use param_store::{Init, LoadReport, ParamStore};
pub use safetensors_loader::SafeTensorsLoader;
