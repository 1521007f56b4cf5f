//! In-memory training pairs.
//!
//! Measurements are simulated once when the dataset is built, never per
//! epoch, so every epoch sees the same noisy `y`.

use std::path::Path;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{RestoreError, Result};
use crate::model::IMAGE_CHANNELS;
use crate::physics::padding::image_dims;
use crate::physics::PhysicsOperator;

/// One mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Ground truth, if the dataset keeps it.
    pub x: Option<Tensor>,
    /// Measurements.
    pub y: Tensor,
}

impl Batch {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.y.dims().first().copied().unwrap_or(0)
    }

    /// Whether the batch holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Measurements with optional ground truth, indexed along dim 0.
#[derive(Debug, Clone)]
pub struct PairedDataset {
    x: Option<Tensor>,
    y: Tensor,
}

impl PairedDataset {
    /// Wrap existing tensors.
    pub fn new(x: Option<Tensor>, y: Tensor) -> Result<Self> {
        let (n, c, _, _) = image_dims(&y, "measurements")?;
        if c != IMAGE_CHANNELS {
            return Err(RestoreError::shape(
                format!("{IMAGE_CHANNELS} measurement channels"),
                format!("{c}"),
            ));
        }
        if let Some(x) = &x {
            let (nx, cx, _, _) = image_dims(x, "ground truth")?;
            if nx != n || cx != c {
                return Err(RestoreError::shape(
                    format!("ground truth with {n} samples of {c} channels"),
                    format!("{nx} samples of {cx} channels"),
                ));
            }
        }
        if n == 0 {
            return Err(RestoreError::dataset("dataset is empty"));
        }
        Ok(Self { x, y })
    }

    /// Simulate measurements of clean images once.
    pub fn from_clean(x: Tensor, physics: &PhysicsOperator, keep_ground_truth: bool) -> Result<Self> {
        let y = physics.forward(&x)?;
        Self::new(keep_ground_truth.then_some(x), y)
    }

    /// Read tensors `x` and/or `y` from a safetensors file.
    ///
    /// A file with only `x` gets its measurements simulated through
    /// `physics`.
    pub fn load(
        path: &Path,
        physics: &PhysicsOperator,
        keep_ground_truth: bool,
        device: &Device,
    ) -> Result<Self> {
        if !path.exists() {
            return Err(RestoreError::dataset(format!(
                "dataset file {} does not exist",
                path.display()
            )));
        }
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let x = tensors.remove("x");
        let y = tensors.remove("y");
        let dataset = match (x, y) {
            (Some(x), None) => Self::from_clean(x, physics, keep_ground_truth)?,
            (x, Some(y)) => Self::new(x.filter(|_| keep_ground_truth), y)?,
            (None, None) => {
                return Err(RestoreError::dataset(format!(
                    "{} holds neither 'x' nor 'y'",
                    path.display()
                )))
            }
        };
        tracing::info!(
            "Loaded {} samples from {} (ground truth: {})",
            dataset.len(),
            path.display(),
            dataset.has_ground_truth()
        );
        Ok(dataset)
    }

    /// Save as a safetensors file with `y` and, if present, `x`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = std::collections::HashMap::new();
        tensors.insert("y".to_string(), self.y.clone());
        if let Some(x) = &self.x {
            tensors.insert("x".to_string(), x.clone());
        }
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.y.dims()[0]
    }

    /// Always false for a constructed dataset.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether ground truth is available.
    pub fn has_ground_truth(&self) -> bool {
        self.x.is_some()
    }

    /// Measurement tensor.
    pub fn measurements(&self) -> &Tensor {
        &self.y
    }

    /// Shuffled mini-batches covering every sample once. The last batch may
    /// be smaller.
    pub fn batches<R: Rng + ?Sized>(&self, rng: &mut R, batch_size: usize) -> Result<Vec<Batch>> {
        if batch_size == 0 {
            return Err(RestoreError::validation("batch_size must be positive"));
        }
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        order.shuffle(rng);
        order
            .chunks(batch_size)
            .map(|chunk| -> Result<Batch> {
                let index = Tensor::from_slice(chunk, chunk.len(), self.y.device())?;
                let y = self.y.index_select(&index, 0)?;
                let x = self
                    .x
                    .as_ref()
                    .map(|x| x.index_select(&index, 0))
                    .transpose()?;
                Ok(Batch { x, y })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownsamplingFilter, PhysicsConfig, Task};
    use candle_core::DType;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sr_physics() -> PhysicsOperator {
        let config = PhysicsConfig {
            task: Task::SuperResolution,
            noise_level: Some(5.0),
            kernel: None,
            sr_factor: Some(2),
            sr_filter: DownsamplingFilter::Bicubic,
            true_adjoint: false,
        };
        PhysicsOperator::from_config(&config, 0, &Device::Cpu).unwrap()
    }

    fn indexed(n: usize) -> Tensor {
        // sample i is filled with the value i
        let data: Vec<f32> = (0..n).flat_map(|i| vec![i as f32; 3 * 16 * 16]).collect();
        Tensor::from_vec(data, (n, 3, 16, 16), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_from_clean_simulates_once() {
        let dataset = PairedDataset::from_clean(indexed(5), &sr_physics(), true).unwrap();
        assert_eq!(dataset.len(), 5);
        assert!(dataset.has_ground_truth());
        assert_eq!(dataset.measurements().dims(), &[5, 3, 8, 8]);

        let y_only = PairedDataset::from_clean(indexed(5), &sr_physics(), false).unwrap();
        assert!(!y_only.has_ground_truth());
    }

    #[test]
    fn test_batches_cover_every_sample() {
        let x = indexed(7);
        let dataset = PairedDataset::new(Some(x.clone()), x).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let batches = dataset.batches(&mut rng, 3).unwrap();
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![3, 3, 1]);

        let mut seen: Vec<u32> = batches
            .iter()
            .flat_map(|b| {
                let x = b.x.as_ref().unwrap();
                let firsts = x.flatten_from(1).unwrap().narrow(1, 0, 1).unwrap();
                firsts.flatten_all().unwrap().to_vec1::<f32>().unwrap()
            })
            .map(|v| v as u32)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffle_differs_between_epochs() {
        let dataset = PairedDataset::new(None, indexed(16)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let order = |batches: Vec<Batch>| -> Vec<f32> {
            batches
                .iter()
                .flat_map(|b| b.y.mean((1, 2, 3)).unwrap().to_vec1::<f32>().unwrap())
                .collect()
        };
        let first = order(dataset.batches(&mut rng, 16).unwrap());
        let second = order(dataset.batches(&mut rng, 16).unwrap());
        assert_ne!(first, second);
    }

    #[test]
    fn test_rejects_mismatched_ground_truth() {
        let y = Tensor::zeros((4, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let x = Tensor::zeros((3, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            PairedDataset::new(Some(x), y),
            Err(RestoreError::Shape { .. })
        ));
        let grey = Tensor::zeros((4, 1, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            PairedDataset::new(None, grey),
            Err(RestoreError::Shape { .. })
        ));
    }

    #[test]
    fn test_saved_measurements_are_not_resimulated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.safetensors");
        let physics = sr_physics();
        let dataset = PairedDataset::from_clean(indexed(3), &physics, true).unwrap();
        dataset.save(&path).unwrap();

        let loaded = PairedDataset::load(&path, &physics, true, &Device::Cpu).unwrap();
        assert!(loaded.has_ground_truth());
        let diff = (loaded.measurements() - dataset.measurements())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);

        let y_only = PairedDataset::load(&path, &physics, false, &Device::Cpu).unwrap();
        assert!(!y_only.has_ground_truth());
    }

    #[test]
    fn test_load_simulates_missing_measurements() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.safetensors");
        let mut tensors = std::collections::HashMap::new();
        tensors.insert("x".to_string(), indexed(2));
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let dataset = PairedDataset::load(&path, &sr_physics(), true, &Device::Cpu).unwrap();
        assert_eq!(dataset.measurements().dims(), &[2, 3, 8, 8]);

        let missing = dir.path().join("missing.safetensors");
        assert!(matches!(
            PairedDataset::load(&missing, &sr_physics(), true, &Device::Cpu),
            Err(RestoreError::Dataset(_))
        ));
    }
}
