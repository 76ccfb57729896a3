//! Named parameter source with seeded fallback initialisation.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use ndarray::{Array1, Array2, ArrayD, Dimension, Ix1, Ix2};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::SafeTensorsLoader;

/// How to fill a parameter the checkpoint does not provide.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Normal { std: f32 },
    Uniform { bound: f32 },
    Zeros,
    Ones,
}

/// Summary of a non-strict load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn log(&self) {
        log::info!(
            "checkpoint load: {} loaded, {} missing, {} unexpected",
            self.loaded,
            self.missing.len(),
            self.unexpected.len()
        );
        if !self.missing.is_empty() {
            log::debug!("missing keys: {:?}", self.missing);
        }
        if !self.unexpected.is_empty() {
            log::debug!("unexpected keys: {:?}", self.unexpected);
        }
    }
}

/// Serves parameters by name from an optional checkpoint.
///
/// Every request is recorded, so once the model is built [`ParamStore::report`]
/// can list checkpoint entries that nothing consumed.
pub struct ParamStore {
    loader: Option<SafeTensorsLoader>,
    rng: StdRng,
    consumed: BTreeSet<String>,
    missing: Vec<String>,
}

impl ParamStore {
    pub fn new(loader: Option<SafeTensorsLoader>, seed: u64) -> Self {
        Self {
            loader,
            rng: StdRng::seed_from_u64(seed),
            consumed: BTreeSet::new(),
            missing: Vec::new(),
        }
    }

    /// A store with no checkpoint; every parameter is initialised.
    pub fn random(seed: u64) -> Self {
        Self::new(None, seed)
    }

    pub fn array1(&mut self, name: &str, len: usize, init: Init) -> Result<Array1<f32>> {
        self.fetch::<Ix1>(name, Ix1(len), init)
    }

    pub fn array2(&mut self, name: &str, shape: (usize, usize), init: Init) -> Result<Array2<f32>> {
        self.fetch::<Ix2>(name, Ix2(shape.0, shape.1), init)
    }

    fn fetch<D: Dimension>(&mut self, name: &str, shape: D, init: Init) -> Result<ndarray::Array<f32, D>> {
        self.consumed.insert(name.to_string());

        if let Some(loader) = &self.loader {
            if let Some(found) = loader.shape(name) {
                if found != shape.slice() {
                    return Err(anyhow!(
                        "shape mismatch for '{}': checkpoint has {:?}, model expects {:?}",
                        name,
                        found,
                        shape.slice()
                    ));
                }
                let tensor: ArrayD<f32> = loader.get_f32(name)?;
                return tensor
                    .into_dimensionality::<D>()
                    .with_context(|| format!("tensor '{}' has the wrong rank", name));
            }
        }

        self.missing.push(name.to_string());
        let arr = match init {
            Init::Normal { std } => {
                let dist = Normal::new(0.0f32, std)
                    .with_context(|| format!("invalid normal std {} for '{}'", std, name))?;
                ndarray::Array::random_using(shape, dist, &mut self.rng)
            }
            Init::Uniform { bound } => {
                ndarray::Array::random_using(shape, Uniform::new_inclusive(-bound, bound), &mut self.rng)
            }
            Init::Zeros => ndarray::Array::zeros(shape),
            Init::Ones => ndarray::Array::ones(shape),
        };
        Ok(arr)
    }

    /// Builds the load report. Unexpected keys are checkpoint entries never requested.
    pub fn report(&self) -> LoadReport {
        let mut unexpected: Vec<String> = self
            .loader
            .as_ref()
            .map(|l| {
                l.tensor_names()
                    .into_iter()
                    .filter(|n| !self.consumed.contains(*n))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        unexpected.sort();

        LoadReport {
            loaded: self.consumed.len() - self.missing.len(),
            missing: self.missing.clone(),
            unexpected,
        }
    }
}
