//! Stein's unbiased risk estimate for Gaussian noise.
//!
//! ```text
//! SURE = mean((A x_hat - y)^2) - sigma^2 + 2 sigma^2 div
//! div  = mean(b * (A f(y + tau b) - A x_hat)) / tau,   b ~ N(0, I)
//! ```
//!
//! `div` is a single-sample Hutchinson estimate of the divergence of
//! `y -> A f(y)` divided by the measurement size. `b` is drawn afresh on
//! every call. `tau` should scale with the range of `y` (0.01 for data in
//! [0, 1]).

use candle_core::Tensor;

use super::{LossFunction, LossInputs};
use crate::config::{LossConfig, Task};
use crate::error::{RestoreError, Result};
use crate::model::RestorationModel;
use crate::physics::noise::NoiseSource;
use crate::physics::padding::image_dims;
use crate::physics::PhysicsOperator;

/// Per-side margin excluded from the SURE residual.
///
/// An explicit `sure_margin` wins. Otherwise, with `partial_sure`, deblurring
/// uses `(k - 1) / 2` for a kernel of support `k` and super-resolution uses 2
/// when `partial_sure_sr` is set.
pub fn resolve_margin(config: &LossConfig, physics: &PhysicsOperator) -> usize {
    if !config.partial_sure {
        return 0;
    }
    if let Some(margin) = config.sure_margin {
        return margin;
    }
    match physics.task() {
        Task::Deblurring => (physics.kernel().support() - 1) / 2,
        Task::SuperResolution if config.partial_sure_sr => 2,
        Task::SuperResolution => 0,
    }
}

/// SURE term with a Monte-Carlo divergence.
#[derive(Debug)]
pub struct SureLoss {
    sigma: f64,
    tau: f64,
    margin: usize,
    cropped_divergence: bool,
    source: NoiseSource,
}

impl SureLoss {
    /// Create the term. `sigma` and `tau` must be positive.
    pub fn new(
        sigma: f64,
        tau: f64,
        margin: usize,
        cropped_divergence: bool,
        source: NoiseSource,
    ) -> Result<Self> {
        if !(sigma > 0.0) || !sigma.is_finite() {
            return Err(RestoreError::validation(format!(
                "SURE needs a positive sigma, got {sigma}"
            )));
        }
        if !(tau > 0.0) || !tau.is_finite() {
            return Err(RestoreError::validation(format!(
                "SURE needs a positive tau, got {tau}"
            )));
        }
        Ok(Self {
            sigma,
            tau,
            margin,
            cropped_divergence,
            source,
        })
    }

    /// Build from the loss section and the physics noise model.
    pub fn from_config(
        config: &LossConfig,
        physics: &PhysicsOperator,
        source: NoiseSource,
    ) -> Result<Self> {
        let sigma = physics.sigma().ok_or_else(|| {
            RestoreError::config("SURE requires a physics operator with a Gaussian noise model")
        })?;
        let margin = resolve_margin(config, physics);
        Self::new(sigma, config.tau, margin, config.sure_cropped_div, source)
    }

    /// Noise standard deviation.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Divergence step.
    pub fn tau(&self) -> f64 {
        self.tau
    }

    /// Per-side crop margin.
    pub fn margin(&self) -> usize {
        self.margin
    }

    pub(crate) fn source(&self) -> &NoiseSource {
        &self.source
    }

    fn check_margin(&self, h: usize, w: usize) -> Result<()> {
        if 2 * self.margin >= h || 2 * self.margin >= w {
            return Err(RestoreError::validation(format!(
                "SURE margin {} leaves nothing of a {h}x{w} measurement",
                self.margin
            )));
        }
        Ok(())
    }

    fn crop(&self, t: &Tensor) -> Result<Tensor> {
        if self.margin == 0 {
            return Ok(t.clone());
        }
        let (_, _, h, w) = image_dims(t, "SURE residual")?;
        let m = self.margin;
        Ok(t.narrow(2, m, h - 2 * m)?.narrow(3, m, w - 2 * m)?)
    }

    /// Monte-Carlo divergence of `y -> A model(y)` at `y`, normalised by
    /// the number of averaged entries. `y1` is `A model(y)`.
    pub fn mc_divergence(
        &self,
        y: &Tensor,
        y1: &Tensor,
        model: &dyn RestorationModel,
        physics: &PhysicsOperator,
    ) -> Result<Tensor> {
        let b = self.source.standard_normal_like(y)?;
        let perturbed = (y + (&b * self.tau)?)?;
        let y2 = physics.apply(&model.forward(&perturbed)?)?;
        let divergence = ((y2 - y1)? * &b)?;
        let divergence = if self.cropped_divergence {
            self.crop(&divergence)?
        } else {
            divergence
        };
        Ok((divergence.mean_all()? / self.tau)?)
    }
}

impl LossFunction for SureLoss {
    fn name(&self) -> &'static str {
        "sure"
    }

    fn requires_estimate(&self) -> bool {
        true
    }

    fn model_evaluations(&self) -> usize {
        1
    }

    fn compute(&self, inputs: &LossInputs<'_>) -> Result<Tensor> {
        let (_, _, h, w) = image_dims(inputs.y, "measurement")?;
        self.check_margin(h, w)?;

        let x_hat = inputs.estimate()?;
        let y1 = inputs.physics.apply(&x_hat)?;
        if y1.dims() != inputs.y.dims() {
            return Err(RestoreError::shape(
                format!("A(x_hat) shaped like y {:?}", inputs.y.dims()),
                format!("{:?}", y1.dims()),
            ));
        }

        let residual = self.crop(&(&y1 - inputs.y)?)?;
        let fidelity = residual.sqr()?.mean_all()?;
        let divergence = self.mc_divergence(inputs.y, &y1, inputs.model, inputs.physics)?;
        let sigma2 = self.sigma * self.sigma;
        Ok((fidelity + divergence.affine(2.0 * sigma2, -sigma2)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownsamplingFilter, Method, PhysicsConfig};
    use crate::model::IdentityModel;
    use candle_core::{DType, Device};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn blur_physics(kernel: &str) -> PhysicsOperator {
        let config = PhysicsConfig {
            task: Task::Deblurring,
            noise_level: Some(5.0),
            kernel: Some(kernel.into()),
            sr_factor: None,
            sr_filter: DownsamplingFilter::Bicubic,
            true_adjoint: false,
        };
        PhysicsOperator::from_config(&config, 0, &Device::Cpu).unwrap()
    }

    struct CountingModel {
        calls: AtomicUsize,
        inner: IdentityModel,
    }

    impl RestorationModel for CountingModel {
        fn forward(&self, y: &Tensor) -> Result<Tensor> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.forward(y)
        }

        fn var_map(&self) -> &candle_nn::VarMap {
            self.inner.var_map()
        }
    }

    #[test]
    fn test_divergence_converges_to_normalised_trace() {
        // identity model: div = mean(b * A b), E[div] = trace(A) / m = 1 / 9
        let physics = blur_physics("box_3");
        let model = IdentityModel::new();
        let sure = SureLoss::new(5.0 / 255.0, 0.01, 0, false, NoiseSource::new(42)).unwrap();
        let y = Tensor::randn(0f32, 1f32, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let y1 = physics.apply(&y).unwrap();

        let samples = 400;
        let mut total = 0.0f64;
        for _ in 0..samples {
            let div = sure.mc_divergence(&y, &y1, &model, &physics).unwrap();
            total += div.to_scalar::<f32>().unwrap() as f64;
        }
        let mean = total / samples as f64;
        assert!((mean - 1.0 / 9.0).abs() < 0.01, "mean divergence {mean}");
    }

    #[test]
    fn test_fresh_perturbation_every_call() {
        let physics = blur_physics("box_3");
        let model = IdentityModel::new();
        let sure = SureLoss::new(0.1, 0.01, 0, false, NoiseSource::new(1)).unwrap();
        let y = Tensor::randn(0f32, 1f32, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let y1 = physics.apply(&y).unwrap();
        let a = sure.mc_divergence(&y, &y1, &model, &physics).unwrap();
        let b = sure.mc_divergence(&y, &y1, &model, &physics).unwrap();
        assert_ne!(a.to_scalar::<f32>().unwrap(), b.to_scalar::<f32>().unwrap());
    }

    #[test]
    fn test_oversized_margin_fails_before_any_evaluation() {
        let physics = blur_physics("box_3");
        let model = CountingModel {
            calls: AtomicUsize::new(0),
            inner: IdentityModel::new(),
        };
        let sure = SureLoss::new(0.02, 0.01, 8, true, NoiseSource::new(0)).unwrap();
        let y = Tensor::zeros((2, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
        let inputs = LossInputs {
            x: None,
            x_hat: None,
            y: &y,
            physics: &physics,
            model: &model,
        };
        assert!(matches!(
            sure.compute(&inputs),
            Err(RestoreError::Validation(_))
        ));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_margin_resolution() {
        let mut config = LossConfig::for_method(Method::Sure);
        let physics = blur_physics("gaussian_1");
        assert_eq!(resolve_margin(&config, &physics), 3);

        config.sure_margin = Some(1);
        assert_eq!(resolve_margin(&config, &physics), 1);

        config.partial_sure = false;
        assert_eq!(resolve_margin(&config, &physics), 0);
    }

    #[test]
    fn test_requires_noise_model() {
        let config = PhysicsConfig {
            task: Task::Deblurring,
            noise_level: None,
            kernel: Some("box_3".into()),
            sr_factor: None,
            sr_filter: DownsamplingFilter::Bicubic,
            true_adjoint: false,
        };
        let physics = PhysicsOperator::from_config(&config, 0, &Device::Cpu).unwrap();
        let loss = LossConfig::for_method(Method::Sure);
        assert!(matches!(
            SureLoss::from_config(&loss, &physics, NoiseSource::new(0)),
            Err(RestoreError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_non_positive_tau() {
        assert!(matches!(
            SureLoss::new(0.1, 0.0, 0, false, NoiseSource::new(0)),
            Err(RestoreError::Validation(_))
        ));
    }

    #[test]
    fn test_cropped_loss_is_finite() {
        let physics = blur_physics("box_3");
        let model = IdentityModel::new();
        let sure = SureLoss::new(0.1, 0.01, 1, true, NoiseSource::new(3)).unwrap();
        let x = Tensor::ones((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let inputs = LossInputs {
            x: None,
            x_hat: Some(&x),
            y: &x,
            physics: &physics,
            model: &model,
        };
        let loss = sure.compute(&inputs).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
    }
}
