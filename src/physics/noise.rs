//! Seeded randomness and the additive Gaussian noise model.

use std::sync::Mutex;

use candle_core::Tensor;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::{RestoreError, Result};

/// A seeded random stream shared behind a lock.
///
/// Every call draws fresh values; nothing is cached between calls. Draws are
/// made on the host and uploaded to the device of the reference tensor.
#[derive(Debug)]
pub struct NoiseSource {
    rng: Mutex<ChaCha8Rng>,
}

impl NoiseSource {
    /// Create a stream from a seed.
    pub fn new(seed: u64) -> Self {
        Self::with_stream(seed, 0)
    }

    /// Create an independent stream derived from a seed.
    pub fn with_stream(seed: u64, stream: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(stream);
        Self {
            rng: Mutex::new(rng),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> T) -> Result<T> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| RestoreError::training("noise source lock poisoned"))?;
        Ok(f(&mut rng))
    }

    /// Draw i.i.d. N(0, 1) values shaped like `like`.
    pub fn standard_normal_like(&self, like: &Tensor) -> Result<Tensor> {
        let count = like.elem_count();
        let values: Vec<f32> = self.with_rng(|rng| {
            (0..count)
                .map(|_| rng.sample::<f32, _>(StandardNormal))
                .collect()
        })?;
        let draw = Tensor::from_vec(values, like.dims(), like.device())?;
        Ok(draw.to_dtype(like.dtype())?)
    }

    /// Draw an index uniformly from `0..upper`.
    pub fn index(&self, upper: usize) -> Result<usize> {
        if upper == 0 {
            return Err(RestoreError::validation("cannot draw from an empty range"));
        }
        self.with_rng(|rng| rng.gen_range(0..upper))
    }

    /// Number of 32-bit words consumed so far.
    pub fn word_pos(&self) -> Result<u128> {
        self.with_rng(|rng| rng.get_word_pos())
    }

    /// Move the stream to a position returned by [`NoiseSource::word_pos`].
    pub fn set_word_pos(&self, word_pos: u128) -> Result<()> {
        self.with_rng(|rng| rng.set_word_pos(word_pos))
    }

    /// Pick one item uniformly.
    pub fn choose<T: Copy>(&self, items: &[T]) -> Result<T> {
        let i = self.index(items.len())?;
        Ok(items[i])
    }
}

/// Additive i.i.d. Gaussian noise with a fixed standard deviation.
#[derive(Debug)]
pub struct GaussianNoise {
    sigma: f64,
    source: NoiseSource,
}

impl GaussianNoise {
    /// Create a noise model. `sigma` must be positive.
    pub fn new(sigma: f64, seed: u64) -> Result<Self> {
        if !(sigma > 0.0) || !sigma.is_finite() {
            return Err(RestoreError::validation(format!(
                "noise sigma must be positive, got {sigma}"
            )));
        }
        Ok(Self {
            sigma,
            source: NoiseSource::new(seed),
        })
    }

    /// Build from a 0-255 noise level.
    pub fn from_level(noise_level: f64, seed: u64) -> Result<Self> {
        Self::new(noise_level / 255.0, seed)
    }

    /// Standard deviation.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Stream the draws come from.
    pub fn source(&self) -> &NoiseSource {
        &self.source
    }

    /// Return `y + sigma * n` with a fresh draw of `n`.
    pub fn apply(&self, y: &Tensor) -> Result<Tensor> {
        let n = self.source.standard_normal_like(y)?;
        Ok((y + (n * self.sigma)?)?)
    }
}
