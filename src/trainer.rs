//! Training loop and optimization.
//!
//! ```text
//! Initializing -> { EpochStart -> BatchStep* -> EpochEnd } x N -> Finalizing -> Done
//! ```
//!
//! Each batch step evaluates the model first only when the loss is a pull
//! loss, then computes the loss, backpropagates and applies one Adam update.
//! Each epoch ends with a scheduler step, a progress record and, every
//! `checkpoint_interval` epochs and after the last one, a full checkpoint.
//! Final weights are written after the last epoch.

use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::checkpoint::{checkpoint_path, load_checkpoint, save_checkpoint, weights_path};
use crate::config::RunConfig;
use crate::dataset::{Batch, PairedDataset};
use crate::error::{RestoreError, Result};
use crate::losses::{CompositeLoss, EstimateMode};
use crate::model::{build_model, save_weights, RestorationModel, IMAGE_CHANNELS};
use crate::optimizer::{Adam, AdamConfig};
use crate::physics::padding::image_dims;
use crate::physics::noise::NoiseSource;
use crate::physics::PhysicsOperator;
use crate::scheduler::MultiStepLr;

/// Shuffle streams start here so they never meet the noise streams.
const SHUFFLE_STREAM_BASE: u64 = 1 << 32;

/// Progress record emitted at the end of every epoch.
#[derive(Debug, Clone)]
pub struct EpochRecord {
    /// 0-based epoch index.
    pub epoch: usize,
    /// Total number of epochs.
    pub epochs: usize,
    /// When the epoch finished.
    pub timestamp: DateTime<Utc>,
    /// Mean training loss over the epoch's batches.
    pub mean_loss: f64,
    /// Learning rate used during the epoch.
    pub learning_rate: f64,
    /// Number of batches.
    pub batches: usize,
    /// Model evaluations performed, including those inside the loss.
    pub model_evaluations: usize,
    /// Whether `mean_loss` is finite.
    pub finite: bool,
}

impl fmt::Display for EpochRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}/{}] Training_Loss: {:.2e}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.epoch + 1,
            self.epochs,
            self.mean_loss
        )
    }
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use sure_ei_rs::{RunConfig, Trainer};
///
/// # fn main() -> sure_ei_rs::Result<()> {
/// let config = RunConfig::from_file("config.yaml")?;
/// let mut trainer = Trainer::from_config(config)?;
/// trainer.train()?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    /// Configuration
    config: RunConfig,
    /// Device for training
    device: Device,
    physics: PhysicsOperator,
    loss: CompositeLoss,
    model: Box<dyn RestorationModel>,
    dataset: PairedDataset,
    optimizer: Adam,
    scheduler: MultiStepLr,
    /// Next epoch to run
    epoch: usize,
    history: Vec<EpochRecord>,
}

impl Trainer {
    /// Wire a trainer around prepared collaborators.
    ///
    /// Validates the configuration and resolves the loss before any
    /// training step runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the method needs a
    /// noise model the physics lacks, or the method needs ground truth the
    /// dataset lacks.
    pub fn new(
        config: RunConfig,
        physics: PhysicsOperator,
        model: Box<dyn RestorationModel>,
        dataset: PairedDataset,
    ) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        if !config.data_parallel_devices.is_empty() {
            tracing::warn!(
                "Data-parallel devices {:?} ignored; training runs on {}",
                config.data_parallel_devices,
                config.device
            );
        }

        let loss = CompositeLoss::from_config(&config.loss, &physics, config.seed)?;
        if loss.requires_ground_truth() && !dataset.has_ground_truth() {
            return Err(RestoreError::config(format!(
                "method {:?} needs ground truth but the dataset has none",
                config.loss.method
            )));
        }

        let learning_rate = config.learning_rate();
        let optimizer = Adam::new(
            model.var_map(),
            AdamConfig::from_training(&config.training, learning_rate),
        )?;
        let scheduler = MultiStepLr::new(
            learning_rate,
            config.training.milestones.clone(),
            config.training.gamma,
        );
        tracing::info!(
            "Initialized Adam optimizer with lr={:.1e}, betas=({}, {})",
            learning_rate,
            config.training.beta1,
            config.training.beta2
        );

        Ok(Self {
            config,
            device,
            physics,
            loss,
            model,
            dataset,
            optimizer,
            scheduler,
            epoch: 0,
            history: Vec::new(),
        })
    }

    /// Build every collaborator from the configuration alone.
    pub fn from_config(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        let physics = PhysicsOperator::from_config(&config.physics, config.seed, &device)?;
        let model = build_model(&config.model, &config.physics, &device)?;
        let dataset = PairedDataset::load(
            Path::new(&config.dataset.path),
            &physics,
            config.dataset.keep_ground_truth,
            &device,
        )?;
        Self::new(config, physics, model, dataset)
    }

    /// Every random stream whose position is checkpointed.
    fn random_streams<'a>(
        physics: &'a PhysicsOperator,
        loss: &'a CompositeLoss,
    ) -> Vec<(String, &'a NoiseSource)> {
        let mut streams: Vec<(String, &NoiseSource)> = physics
            .noise_source()
            .map(|source| ("physics".to_string(), source))
            .into_iter()
            .collect();
        streams.extend(
            loss.noise_sources()
                .into_iter()
                .map(|(key, source)| (format!("loss.{key}"), source)),
        );
        streams
    }

    /// Restore a full checkpoint and continue after its epoch.
    pub fn resume_from<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let streams = Self::random_streams(&self.physics, &self.loss);
        let epoch = load_checkpoint(
            path.as_ref(),
            self.model.var_map(),
            &mut self.optimizer,
            &mut self.scheduler,
            &streams,
        )?;
        self.epoch = epoch + 1;
        tracing::info!("Resuming at epoch {}/{}", self.epoch + 1, self.config.training.epochs);
        Ok(())
    }

    /// Run every remaining epoch, then write the final weights.
    pub fn train(&mut self) -> Result<&[EpochRecord]> {
        let epochs = self.config.training.epochs;
        tracing::info!("Starting training");
        tracing::info!("  Task: {:?}", self.physics.task());
        tracing::info!("  Method: {:?}", self.config.loss.method);
        tracing::info!("  Samples: {}", self.dataset.len());
        tracing::info!("  Epochs: {}", epochs);

        std::fs::create_dir_all(self.output_dir())?;
        while self.epoch < epochs {
            self.train_epoch()?;
        }

        let path = weights_path(&self.output_dir());
        save_weights(self.model.var_map(), &path)?;
        tracing::info!("Saved final weights to: {}", path.display());
        Ok(&self.history)
    }

    /// Run one epoch: shuffled batches, scheduler step, progress record and
    /// checkpoint when due.
    pub fn train_epoch(&mut self) -> Result<EpochRecord> {
        let epoch = self.epoch;
        let epochs = self.config.training.epochs;

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        rng.set_stream(SHUFFLE_STREAM_BASE + epoch as u64);
        let batches = self
            .dataset
            .batches(&mut rng, self.config.training.batch_size)?;

        let pb = if self.config.training.progress_bar {
            let pb = ProgressBar::new(batches.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>4}/{len:4} {msg}")?
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let learning_rate = self.optimizer.learning_rate();
        let mut total = 0.0;
        for batch in &batches {
            let loss = self.train_step(batch)?;
            total += loss;
            pb.set_message(format!("{loss:.4e}"));
            pb.inc(1);
        }
        pb.finish_and_clear();

        self.scheduler.step(&mut self.optimizer);

        let mean_loss = total / batches.len().max(1) as f64;
        let record = EpochRecord {
            epoch,
            epochs,
            timestamp: Utc::now(),
            mean_loss,
            learning_rate,
            batches: batches.len(),
            model_evaluations: batches.len() * self.loss.evaluations_per_batch(),
            finite: mean_loss.is_finite(),
        };
        tracing::info!("{record}");
        self.history.push(record.clone());

        if !record.finite {
            tracing::warn!("Non-finite training loss at epoch {}", epoch + 1);
            if self.config.training.halt_on_divergence {
                return Err(RestoreError::training(format!(
                    "training diverged at epoch {} (loss {})",
                    epoch + 1,
                    mean_loss
                )));
            }
        }

        if epoch % self.config.training.checkpoint_interval == 0 || epoch + 1 == epochs {
            save_checkpoint(
                &checkpoint_path(&self.output_dir(), epoch),
                epoch,
                self.model.var_map(),
                &self.optimizer,
                &self.scheduler,
                &Self::random_streams(&self.physics, &self.loss),
            )?;
        }

        self.epoch += 1;
        Ok(record)
    }

    /// One optimisation step on a batch. Returns the loss value.
    pub fn train_step(&mut self, batch: &Batch) -> Result<f64> {
        let (n, c, _, _) = image_dims(&batch.y, "measurement batch")?;
        if c != IMAGE_CHANNELS {
            return Err(RestoreError::shape(
                format!("{IMAGE_CHANNELS} measurement channels"),
                format!("{c}"),
            ));
        }
        let y = batch.y.to_device(&self.device)?;
        let x = match &batch.x {
            Some(x) => {
                let (nx, cx, _, _) = image_dims(x, "ground-truth batch")?;
                if nx != n || cx != c {
                    return Err(RestoreError::shape(
                        format!("ground truth with {n} samples of {c} channels"),
                        format!("{nx} samples of {cx} channels"),
                    ));
                }
                Some(x.to_device(&self.device)?)
            }
            None => None,
        };

        let x_hat = match self.loss.estimate_mode() {
            EstimateMode::Pull => Some(self.model.forward(&y)?),
            EstimateMode::Push => None,
        };
        let loss = self.loss.compute(
            x.as_ref(),
            x_hat.as_ref(),
            &y,
            &self.physics,
            self.model.as_ref(),
        )?;
        let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;

        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;
        tracing::debug!("step {}: loss {:.4e}", self.optimizer.step_count(), value);
        Ok(value)
    }

    /// Output directory.
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.output_dir)
    }

    /// Index of the next epoch to run.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Records of the epochs run by this trainer.
    pub fn history(&self) -> &[EpochRecord] {
        &self.history
    }

    /// Network being trained.
    pub fn model(&self) -> &dyn RestorationModel {
        self.model.as_ref()
    }

    /// Forward operator.
    pub fn physics(&self) -> &PhysicsOperator {
        &self.physics
    }

    /// Resolved loss.
    pub fn loss(&self) -> &CompositeLoss {
        &self.loss
    }

    /// Optimizer state.
    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Scheduler state.
    pub fn scheduler(&self) -> &MultiStepLr {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LossConfig, Method, ModelConfig, ModelKind};
    use crate::model::ConvNet;
    use candle_core::{Tensor, Var};
    use candle_nn::VarMap;

    struct NanModel {
        var_map: VarMap,
        scale: Var,
    }

    impl NanModel {
        fn new() -> Self {
            let var_map = VarMap::new();
            var_map
                .get((1,), "scale", candle_nn::Init::Const(f64::NAN), DType::F32, &Device::Cpu)
                .unwrap();
            let scale = var_map.all_vars().into_iter().next().unwrap();
            Self { var_map, scale }
        }
    }

    impl RestorationModel for NanModel {
        fn forward(&self, y: &Tensor) -> Result<Tensor> {
            Ok(y.broadcast_mul(self.scale.as_tensor())?)
        }

        fn var_map(&self) -> &VarMap {
            &self.var_map
        }
    }

    fn config(dir: &Path, epochs: usize) -> RunConfig {
        let mut config = RunConfig::deblur_sure_preset();
        config.physics.kernel = Some("box_3".into());
        config.training.epochs = epochs;
        config.training.batch_size = 2;
        config.training.checkpoint_interval = 2;
        config.model = ModelConfig {
            kind: ModelKind::Cnn,
            hidden_channels: 4,
            num_conv_blocks: 1,
            residual: true,
        };
        config.output_dir = dir.to_string_lossy().into_owned();
        config
    }

    fn parts(config: &RunConfig, samples: usize) -> (PhysicsOperator, PairedDataset) {
        let physics =
            PhysicsOperator::from_config(&config.physics, config.seed, &Device::Cpu).unwrap();
        let x = Tensor::rand(0f32, 1f32, (samples, 3, 12, 12), &Device::Cpu).unwrap();
        let dataset = PairedDataset::from_clean(x, &physics, true).unwrap();
        (physics, dataset)
    }

    #[test]
    fn test_train_step_updates_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 1);
        let (physics, dataset) = parts(&config, 2);
        let model = ConvNet::new(&config.model, 1, &Device::Cpu).unwrap();
        let mut trainer = Trainer::new(config, physics, Box::new(model), dataset.clone()).unwrap();

        let before = trainer.model().var_map().all_vars()[0].as_tensor().copy().unwrap();
        let batch = Batch {
            x: None,
            y: dataset.measurements().clone(),
        };
        let loss = trainer.train_step(&batch).unwrap();
        assert!(loss.is_finite());
        let after = trainer.model().var_map().all_vars()[0].as_tensor().copy().unwrap();
        let moved = (after - before).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(moved.to_scalar::<f32>().unwrap() > 0.0);
        assert_eq!(trainer.optimizer().step_count(), 1);
    }

    #[test]
    fn test_malformed_batch_is_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 1);
        let (physics, dataset) = parts(&config, 2);
        let model = ConvNet::new(&config.model, 1, &Device::Cpu).unwrap();
        let mut trainer = Trainer::new(config, physics, Box::new(model), dataset).unwrap();
        let batch = Batch {
            x: None,
            y: Tensor::zeros((2, 12, 12), DType::F32, &Device::Cpu).unwrap(),
        };
        assert!(matches!(
            trainer.train_step(&batch),
            Err(RestoreError::Shape { .. })
        ));
    }

    #[test]
    fn test_divergent_loss_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        let (physics, dataset) = parts(&config, 4);
        let mut trainer = Trainer::new(config, physics, Box::new(NanModel::new()), dataset).unwrap();
        let history = trainer.train().unwrap().to_vec();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| !r.finite));
        assert!(dir.path().join("weights.safetensors").exists());
    }

    #[test]
    fn test_halt_on_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 3);
        config.training.halt_on_divergence = true;
        let (physics, dataset) = parts(&config, 4);
        let mut trainer = Trainer::new(config, physics, Box::new(NanModel::new()), dataset).unwrap();
        assert!(matches!(trainer.train(), Err(RestoreError::Training(_))));
        assert_eq!(trainer.history().len(), 1);
    }

    #[test]
    fn test_supervised_needs_ground_truth() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 1);
        config.loss = LossConfig::for_method(Method::Sup);
        let physics =
            PhysicsOperator::from_config(&config.physics, config.seed, &Device::Cpu).unwrap();
        let x = Tensor::rand(0f32, 1f32, (2, 3, 12, 12), &Device::Cpu).unwrap();
        let dataset = PairedDataset::from_clean(x, &physics, false).unwrap();
        let model = ConvNet::new(&config.model, 1, &Device::Cpu).unwrap();
        assert!(matches!(
            Trainer::new(config, physics, Box::new(model), dataset),
            Err(RestoreError::Config(_))
        ));
    }

    #[test]
    fn test_progress_line_layout() {
        let record = EpochRecord {
            epoch: 4,
            epochs: 500,
            timestamp: DateTime::parse_from_rfc3339("2024-03-01T12:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            mean_loss: 0.00123,
            learning_rate: 5e-4,
            batches: 10,
            model_evaluations: 20,
            finite: true,
        };
        assert_eq!(
            record.to_string(),
            "2024-03-01 12:30:00 [5/500] Training_Loss: 1.23e-3"
        );
    }
}
