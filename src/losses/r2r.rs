//! Recorrupted-to-recorrupted combined with equivariant imaging.
//!
//! The measurement is split into two noisy copies that share the same
//! clean signal but carry independent noise:
//! `y1 = y + alpha sigma z`, `y2 = y - (sigma / alpha) z`. The network sees
//! `y1` and is asked to predict `y2` through the physics, which is an
//! unbiased proxy for the measurement-domain error. The term evaluates the
//! model itself, so callers must not precompute an estimate.

use candle_core::Tensor;

use super::ei::EquivariantLoss;
use super::{mse, LossFunction, LossInputs};
use crate::error::{RestoreError, Result};
use crate::physics::noise::NoiseSource;

/// R2R fidelity plus equivariant consistency of the R2R estimate.
#[derive(Debug)]
pub struct R2rEquivariantLoss {
    sigma: f64,
    alpha: f64,
    equivariant: EquivariantLoss,
    source: NoiseSource,
}

impl R2rEquivariantLoss {
    /// Create the term. `sigma` and `alpha` must be positive.
    pub fn new(
        sigma: f64,
        alpha: f64,
        equivariant: EquivariantLoss,
        source: NoiseSource,
    ) -> Result<Self> {
        if !(sigma > 0.0) || !sigma.is_finite() {
            return Err(RestoreError::validation(format!(
                "R2R needs a positive sigma, got {sigma}"
            )));
        }
        if !(alpha > 0.0) || !alpha.is_finite() {
            return Err(RestoreError::validation(format!(
                "R2R needs a positive alpha, got {alpha}"
            )));
        }
        Ok(Self {
            sigma,
            alpha,
            equivariant,
            source,
        })
    }

    /// Recorruption strength.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Equivariant term applied to the R2R estimate.
    pub fn equivariant(&self) -> &EquivariantLoss {
        &self.equivariant
    }

    pub(crate) fn source(&self) -> &NoiseSource {
        &self.source
    }

    /// Recorrupted input and target pair for `y`.
    pub fn recorrupt(&self, y: &Tensor) -> Result<(Tensor, Tensor)> {
        let z = self.source.standard_normal_like(y)?;
        let y1 = (y + (&z * (self.alpha * self.sigma))?)?;
        let y2 = (y - (&z * (self.sigma / self.alpha))?)?;
        Ok((y1, y2))
    }
}

impl LossFunction for R2rEquivariantLoss {
    fn name(&self) -> &'static str {
        "r2r-ei"
    }

    fn requires_estimate(&self) -> bool {
        false
    }

    fn model_evaluations(&self) -> usize {
        1 + self.equivariant.model_evaluations()
    }

    fn compute(&self, inputs: &LossInputs<'_>) -> Result<Tensor> {
        let (y1, y2) = self.recorrupt(inputs.y)?;
        let x_hat = inputs.model.forward(&y1)?;
        let fidelity = mse(&inputs.physics.apply(&x_hat)?, &y2)?;
        let consistency = self
            .equivariant
            .consistency(&x_hat, inputs.physics, inputs.model)?;
        Ok((fidelity + consistency)?)
    }
}
