//! SafeTensors checkpoint reader backed by a memory map.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use half::{bf16, f16};
use memmap2::Mmap;
use ndarray::ArrayD;
use safetensors::{Dtype, SafeTensors};

/// Location of one tensor inside the mapped file.
#[derive(Debug, Clone)]
struct TensorEntry {
    dtype: Dtype,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

/// A loader for a single `.safetensors` checkpoint.
#[derive(Debug)]
pub struct SafeTensorsLoader {
    mmap: Mmap,
    entries: HashMap<String, TensorEntry>,
}

impl SafeTensorsLoader {
    /// Opens a checkpoint.
    ///
    /// Accepts either a direct file path or a directory containing
    /// `model.safetensors`.
    pub fn new(path: &Path) -> Result<Self> {
        let file_path = if path.is_dir() {
            path.join("model.safetensors")
        } else {
            path.to_path_buf()
        };

        let file = File::open(&file_path)
            .with_context(|| format!("failed to open checkpoint {:?}", file_path))?;
        // SAFETY: the checkpoint is treated as read-only for the lifetime of the map.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to mmap checkpoint {:?}", file_path))?;

        let (header_len, metadata) = SafeTensors::read_metadata(&mmap[..])
            .with_context(|| format!("failed to parse safetensors: {:?}", file_path))?;
        let data_start = 8 + header_len;

        let entries: HashMap<String, TensorEntry> = metadata
            .tensors()
            .into_iter()
            .map(|(name, info)| {
                let (start, end) = info.data_offsets;
                (
                    name,
                    TensorEntry {
                        dtype: info.dtype,
                        shape: info.shape.clone(),
                        start: data_start + start,
                        end: data_start + end,
                    },
                )
            })
            .collect();

        log::info!(
            "loaded safetensors checkpoint: {} tensors from {:?}",
            entries.len(),
            file_path.file_name().unwrap_or_default()
        );

        Ok(Self { mmap, entries })
    }

    /// Returns all tensor names in this checkpoint.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn tensor_count(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.entries.get(name).map(|e| e.shape.as_slice())
    }

    /// Reads a tensor and converts it to `f32`.
    pub fn get_f32(&self, name: &str) -> Result<ArrayD<f32>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| anyhow!("tensor '{}' not found in checkpoint", name))?;
        let bytes = &self.mmap[entry.start..entry.end];

        let values: Vec<f32> = match entry.dtype {
            Dtype::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Dtype::BF16 => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            other => {
                return Err(anyhow!(
                    "tensor '{}' has unsupported dtype {:?}",
                    name,
                    other
                ))
            }
        };

        ArrayD::from_shape_vec(entry.shape.clone(), values)
            .with_context(|| format!("tensor '{}' has inconsistent byte length", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::test_util::write_safetensors;

    #[test]
    fn test_load_nonexistent_path() {
        let result = SafeTensorsLoader::new(Path::new("nonexistent.safetensors"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.safetensors");
        std::fs::write(&model_path, b"invalid content").unwrap();

        let result = SafeTensorsLoader::new(dir.path());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("failed to parse"));
    }

    #[test]
    fn test_single_file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefix.safetensors");
        write_safetensors(
            &path,
            &[
                ("layer1.weight", vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]),
                ("layer1.bias", vec![0.1, 0.2], vec![2]),
            ],
        )
        .unwrap();

        let loader = SafeTensorsLoader::new(&path).unwrap();
        assert_eq!(loader.tensor_count(), 2);
        assert!(loader.contains("layer1.weight"));
        assert!(!loader.contains("nonexistent"));
        assert_eq!(loader.shape("layer1.weight"), Some(&[2usize, 2][..]));

        let w = loader
            .get_f32("layer1.weight")
            .unwrap()
            .into_dimensionality::<ndarray::Ix2>()
            .unwrap();
        assert_eq!(w.shape(), &[2, 2]);
        assert_eq!(w[[1, 0]], 3.0);
    }

    #[test]
    fn test_directory_resolves_model_file() {
        let dir = tempfile::tempdir().unwrap();
        write_safetensors(
            &dir.path().join("model.safetensors"),
            &[("a.weight", vec![1.0], vec![1])],
        )
        .unwrap();

        let loader = SafeTensorsLoader::new(dir.path()).unwrap();
        assert_eq!(loader.tensor_names(), vec!["a.weight"]);
    }

    #[test]
    fn test_missing_tensor_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_safetensors(&path, &[("exists.weight", vec![1.0], vec![1])]).unwrap();

        let loader = SafeTensorsLoader::new(&path).unwrap();
        let result = loader.get_f32("does_not_exist");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not found"));
    }
}
