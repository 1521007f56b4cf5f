//! Supervised mean-squared error.

use candle_core::Tensor;

use super::{mse, LossFunction, LossInputs};
use crate::error::{RestoreError, Result};

/// `mse(x_hat, x)`. Needs ground truth.
#[derive(Debug, Clone, Default)]
pub struct SupervisedLoss;

impl LossFunction for SupervisedLoss {
    fn name(&self) -> &'static str {
        "supervised"
    }

    fn requires_estimate(&self) -> bool {
        true
    }

    fn model_evaluations(&self) -> usize {
        0
    }

    fn requires_ground_truth(&self) -> bool {
        true
    }

    fn compute(&self, inputs: &LossInputs<'_>) -> Result<Tensor> {
        let x = inputs
            .x
            .ok_or_else(|| RestoreError::training("supervised loss needs ground truth"))?;
        let x_hat = inputs.estimate()?;
        mse(&x_hat, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownsamplingFilter, PhysicsConfig, Task};
    use crate::model::IdentityModel;
    use crate::physics::PhysicsOperator;
    use candle_core::{DType, Device};

    fn physics() -> PhysicsOperator {
        let config = PhysicsConfig {
            task: Task::Deblurring,
            noise_level: None,
            kernel: Some("box_3".into()),
            sr_factor: None,
            sr_filter: DownsamplingFilter::Bicubic,
            true_adjoint: false,
        };
        PhysicsOperator::from_config(&config, 0, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_mean_squared_error() {
        let physics = physics();
        let model = IdentityModel::new();
        let x = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let x_hat = Tensor::full(2f32, (1, 3, 4, 4), &Device::Cpu).unwrap();
        let inputs = LossInputs {
            x: Some(&x),
            x_hat: Some(&x_hat),
            y: &x,
            physics: &physics,
            model: &model,
        };
        let loss = SupervisedLoss.compute(&inputs).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 4.0);
    }

    #[test]
    fn test_missing_ground_truth() {
        let physics = physics();
        let model = IdentityModel::new();
        let y = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let inputs = LossInputs {
            x: None,
            x_hat: Some(&y),
            y: &y,
            physics: &physics,
            model: &model,
        };
        assert!(matches!(
            SupervisedLoss.compute(&inputs),
            Err(RestoreError::Training(_))
        ));
    }
}
