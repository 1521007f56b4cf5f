//! Physics forward operators.
//!
//! A [`PhysicsOperator`] simulates the measurement process: a deterministic
//! linear map `A` (circular blur or anti-aliased decimation) followed by
//! optional additive Gaussian noise. Noise is only ever added after `A`.
//!
//! # Example
//!
//! ```rust
//! use candle_core::{DType, Device, Tensor};
//! use sure_ei_rs::config::{DownsamplingFilter, PhysicsConfig, Task};
//! use sure_ei_rs::physics::PhysicsOperator;
//!
//! # fn main() -> sure_ei_rs::Result<()> {
//! let config = PhysicsConfig {
//!     task: Task::SuperResolution,
//!     noise_level: Some(5.0),
//!     kernel: None,
//!     sr_factor: Some(2),
//!     sr_filter: DownsamplingFilter::Bicubic,
//!     true_adjoint: true,
//! };
//! let physics = PhysicsOperator::from_config(&config, 0, &Device::Cpu)?;
//! let x = Tensor::zeros((1, 3, 16, 16), DType::F32, &Device::Cpu)?;
//! let y = physics.forward(&x)?;
//! assert_eq!(y.dims(), &[1, 3, 8, 8]);
//! # Ok(())
//! # }
//! ```

pub mod blur;
pub mod downsampling;
pub mod kernels;
pub mod noise;
pub mod padding;

use candle_core::{Device, Tensor};

pub use blur::Blur;
pub use downsampling::Downsampling;
pub use kernels::{Kernel, KernelSource};
pub use noise::{GaussianNoise, NoiseSource};

use crate::config::{PhysicsConfig, Task};
use crate::error::{RestoreError, Result};

/// The linear part of the measurement process.
#[derive(Debug)]
pub enum ForwardMap {
    /// Circular blur (including the CT-like filter).
    Blur(Blur),
    /// Anti-aliased decimation.
    Downsampling(Downsampling),
}

/// Forward operator plus noise model. Immutable after construction.
#[derive(Debug)]
pub struct PhysicsOperator {
    task: Task,
    map: ForwardMap,
    noise: Option<GaussianNoise>,
}

impl PhysicsOperator {
    /// Assemble an operator from parts.
    pub fn new(task: Task, map: ForwardMap, noise: Option<GaussianNoise>) -> Self {
        Self { task, map, noise }
    }

    /// Build the operator described by `config`.
    ///
    /// Unknown kernels and missing task parameters are configuration errors;
    /// a non-positive noise level is a validation error.
    pub fn from_config(config: &PhysicsConfig, seed: u64, device: &Device) -> Result<Self> {
        let map = match config.task {
            Task::Deblurring => {
                let spec = config.kernel.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| {
                    RestoreError::config(
                        "deblurring requires a kernel path or procedural kernel name",
                    )
                })?;
                let source = KernelSource::resolve(spec);
                let kernel = source.load()?;
                tracing::debug!(
                    "Blur kernel {:?}: {}x{}",
                    source,
                    kernel.height(),
                    kernel.width()
                );
                ForwardMap::Blur(Blur::new(kernel, device)?)
            }
            Task::SuperResolution => {
                let factor = config
                    .sr_factor
                    .ok_or_else(|| RestoreError::config("super-resolution requires sr_factor"))?;
                ForwardMap::Downsampling(Downsampling::new(
                    factor,
                    config.sr_filter,
                    config.true_adjoint,
                    device,
                )?)
            }
        };
        let noise = config
            .noise_level
            .map(|level| GaussianNoise::from_level(level, seed))
            .transpose()?;
        Ok(Self::new(config.task, map, noise))
    }

    /// Restoration task.
    pub fn task(&self) -> Task {
        self.task
    }

    /// Linear part.
    pub fn map(&self) -> &ForwardMap {
        &self.map
    }

    /// Blur kernel or anti-aliasing filter.
    pub fn kernel(&self) -> &Kernel {
        match &self.map {
            ForwardMap::Blur(blur) => blur.kernel(),
            ForwardMap::Downsampling(down) => down.kernel(),
        }
    }

    /// Whether a Gaussian noise model is attached.
    pub fn has_noise_model(&self) -> bool {
        self.noise.is_some()
    }

    /// Noise standard deviation, if any.
    pub fn sigma(&self) -> Option<f64> {
        self.noise.as_ref().map(GaussianNoise::sigma)
    }

    /// Random stream of the noise model, if any.
    pub fn noise_source(&self) -> Option<&NoiseSource> {
        self.noise.as_ref().map(GaussianNoise::source)
    }

    /// Noiseless forward map `A x`.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match &self.map {
            ForwardMap::Blur(blur) => blur.apply(x),
            ForwardMap::Downsampling(down) => down.apply(x),
        }
    }

    /// Add measurement noise (identity without a noise model).
    pub fn noise(&self, y: &Tensor) -> Result<Tensor> {
        match &self.noise {
            Some(noise) => noise.apply(y),
            None => Ok(y.clone()),
        }
    }

    /// Simulate a noisy measurement `A x + n`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.noise(&self.apply(x)?)
    }

    /// Adjoint or approximate inverse of `A`.
    pub fn adjoint(&self, y: &Tensor) -> Result<Tensor> {
        match &self.map {
            ForwardMap::Blur(blur) => blur.adjoint(y),
            ForwardMap::Downsampling(down) => down.adjoint(y),
        }
    }

    /// Measurement shape for a signal shape.
    pub fn output_shape(&self, signal: (usize, usize, usize, usize)) -> (usize, usize, usize, usize) {
        let (b, c, h, w) = signal;
        match &self.map {
            ForwardMap::Blur(_) => (b, c, h, w),
            ForwardMap::Downsampling(down) => (b, c, h / down.factor(), w / down.factor()),
        }
    }
}
