//! Equivariant imaging consistency.

use candle_core::Tensor;

use super::transforms::Transform;
use super::{mse, LossFunction, LossInputs};
use crate::error::{RestoreError, Result};
use crate::model::RestorationModel;
use crate::physics::noise::NoiseSource;
use crate::physics::PhysicsOperator;

/// `weight * mse(model(A T(x_hat) [+ n]), T(x_hat))`.
#[derive(Debug)]
pub struct EquivariantLoss {
    transform: Transform,
    weight: f64,
    stop_gradient: bool,
    apply_noise: bool,
    source: NoiseSource,
}

impl EquivariantLoss {
    /// Create the term. `weight` must be non-negative.
    pub fn new(
        transform: Transform,
        weight: f64,
        stop_gradient: bool,
        apply_noise: bool,
        source: NoiseSource,
    ) -> Result<Self> {
        if !(weight >= 0.0) || !weight.is_finite() {
            return Err(RestoreError::validation(format!(
                "equivariant loss weight must be non-negative, got {weight}"
            )));
        }
        Ok(Self {
            transform,
            weight,
            stop_gradient,
            apply_noise,
            source,
        })
    }

    /// Transform group.
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Tradeoff weight.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub(crate) fn source(&self) -> &NoiseSource {
        &self.source
    }

    /// Weighted consistency of `model` under a fresh transform of `x_hat`.
    pub fn consistency(
        &self,
        x_hat: &Tensor,
        physics: &PhysicsOperator,
        model: &dyn RestorationModel,
    ) -> Result<Tensor> {
        let mut x2 = self.transform.apply(x_hat, &self.source)?;
        if self.stop_gradient {
            x2 = x2.detach();
        }
        let y = if self.apply_noise {
            physics.forward(&x2)?
        } else {
            physics.apply(&x2)?
        };
        let x3 = model.forward(&y)?;
        Ok((mse(&x3, &x2)? * self.weight)?)
    }
}

impl LossFunction for EquivariantLoss {
    fn name(&self) -> &'static str {
        "ei"
    }

    fn requires_estimate(&self) -> bool {
        true
    }

    fn model_evaluations(&self) -> usize {
        1
    }

    fn compute(&self, inputs: &LossInputs<'_>) -> Result<Tensor> {
        let x_hat = inputs.estimate()?;
        self.consistency(&x_hat, inputs.physics, inputs.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Task;
    use crate::model::IdentityModel;
    use crate::physics::{Blur, ForwardMap, GaussianNoise, Kernel};
    use candle_core::{Device, Var};

    fn delta_physics() -> PhysicsOperator {
        let blur = Blur::new(Kernel::new(vec![1.0], 1, 1).unwrap(), &Device::Cpu).unwrap();
        let noise = GaussianNoise::from_level(5.0, 0).unwrap();
        PhysicsOperator::new(Task::Deblurring, ForwardMap::Blur(blur), Some(noise))
    }

    #[test]
    fn test_exactly_zero_when_everything_commutes() {
        let physics = delta_physics();
        let model = IdentityModel::new();
        let loss =
            EquivariantLoss::new(Transform::Identity, 1.0, true, false, NoiseSource::new(0))
                .unwrap();
        let x_hat = Tensor::randn(0f32, 1f32, (2, 3, 8, 8), &Device::Cpu).unwrap();
        let value = loss.consistency(&x_hat, &physics, &model).unwrap();
        assert_eq!(value.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_noise_breaks_consistency() {
        let physics = delta_physics();
        let model = IdentityModel::new();
        let loss =
            EquivariantLoss::new(Transform::Shift, 1.0, true, true, NoiseSource::new(0)).unwrap();
        let x_hat = Tensor::zeros((1, 3, 8, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
        let value = loss.consistency(&x_hat, &physics, &model).unwrap();
        let sigma = 5.0f32 / 255.0;
        let v = value.to_scalar::<f32>().unwrap();
        assert!(v > 0.5 * sigma * sigma && v < 2.0 * sigma * sigma, "{v}");
    }

    #[test]
    fn test_stop_gradient_blocks_reference_branch() {
        let physics = delta_physics();
        let model = IdentityModel::new();
        let var = Var::from_tensor(
            &Tensor::randn(0f32, 1f32, (1, 3, 4, 4), &Device::Cpu).unwrap(),
        )
        .unwrap();

        // identity model and noiseless delta physics make both branches
        // depend on x_hat; detaching leaves only the x3 branch
        let detached =
            EquivariantLoss::new(Transform::Rotate, 1.0, true, false, NoiseSource::new(1))
                .unwrap();
        let grads = detached
            .consistency(var.as_tensor(), &physics, &model)
            .unwrap()
            .backward()
            .unwrap();
        assert!(grads.get(var.as_tensor()).is_none());

        let attached =
            EquivariantLoss::new(Transform::Rotate, 1.0, false, false, NoiseSource::new(1))
                .unwrap();
        let grads = attached
            .consistency(var.as_tensor(), &physics, &model)
            .unwrap()
            .backward()
            .unwrap();
        assert!(grads.get(var.as_tensor()).is_some());
    }

    #[test]
    fn test_weight_is_validated() {
        assert!(matches!(
            EquivariantLoss::new(Transform::Shift, -1.0, true, true, NoiseSource::new(0)),
            Err(RestoreError::Validation(_))
        ));
    }
}
