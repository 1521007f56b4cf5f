//! Training losses.
//!
//! A method resolves once, at construction, into an ordered list of
//! [`LossTerm`]s held by a [`CompositeLoss`]. Each term declares whether it
//! consumes a precomputed estimate ("pull") or evaluates the model itself
//! ("push"); the composite folds that into a single [`EstimateMode`] the
//! trainer reads once.

pub mod ei;
pub mod r2r;
pub mod supervised;
pub mod sure;
pub mod transforms;

use candle_core::Tensor;

pub use ei::EquivariantLoss;
pub use r2r::R2rEquivariantLoss;
pub use supervised::SupervisedLoss;
pub use sure::SureLoss;
pub use transforms::Transform;

use crate::config::{LossConfig, Method, SureAlternative};
use crate::error::{RestoreError, Result};
use crate::model::RestorationModel;
use crate::physics::noise::NoiseSource;
use crate::physics::PhysicsOperator;

/// Everything a loss term may read.
pub struct LossInputs<'a> {
    /// Ground truth, when the dataset has it.
    pub x: Option<&'a Tensor>,
    /// Precomputed estimate `model(y)`, for pull losses.
    pub x_hat: Option<&'a Tensor>,
    /// Measurement batch.
    pub y: &'a Tensor,
    /// Forward operator.
    pub physics: &'a PhysicsOperator,
    /// Network being trained.
    pub model: &'a dyn RestorationModel,
}

impl LossInputs<'_> {
    /// The supplied estimate, or a fresh `model(y)` when none was supplied.
    pub fn estimate(&self) -> Result<Tensor> {
        match self.x_hat {
            Some(x_hat) => Ok(x_hat.clone()),
            None => self.model.forward(self.y),
        }
    }
}

/// Common interface of loss terms.
pub trait LossFunction {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether the term reads a precomputed `x_hat`.
    fn requires_estimate(&self) -> bool;

    /// Model evaluations per call beyond the precomputed estimate.
    fn model_evaluations(&self) -> usize;

    /// Whether the term reads ground truth.
    fn requires_ground_truth(&self) -> bool {
        false
    }

    /// Scalar loss.
    fn compute(&self, inputs: &LossInputs<'_>) -> Result<Tensor>;
}

/// Mean squared error with an explicit shape check.
pub fn mse(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.dims() != b.dims() {
        return Err(RestoreError::shape(format!("{:?}", b.dims()), format!("{:?}", a.dims())));
    }
    Ok((a - b)?.sqr()?.mean_all()?)
}

/// One weighted term of a composite loss.
#[derive(Debug)]
pub enum LossTerm {
    /// Supervised MSE.
    Supervised(SupervisedLoss),
    /// SURE with Monte-Carlo divergence.
    Sure(SureLoss),
    /// Equivariant imaging.
    Equivariant(EquivariantLoss),
    /// R2R combined with equivariant imaging.
    R2rEquivariant(R2rEquivariantLoss),
}

impl LossTerm {
    fn inner(&self) -> &dyn LossFunction {
        match self {
            Self::Supervised(t) => t,
            Self::Sure(t) => t,
            Self::Equivariant(t) => t,
            Self::R2rEquivariant(t) => t,
        }
    }

    /// Random streams the term draws from, in a fixed order.
    pub fn noise_sources(&self) -> Vec<&NoiseSource> {
        match self {
            Self::Supervised(_) => Vec::new(),
            Self::Sure(t) => vec![t.source()],
            Self::Equivariant(t) => vec![t.source()],
            Self::R2rEquivariant(t) => vec![t.source(), t.equivariant().source()],
        }
    }
}

impl LossFunction for LossTerm {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn requires_estimate(&self) -> bool {
        self.inner().requires_estimate()
    }

    fn model_evaluations(&self) -> usize {
        self.inner().model_evaluations()
    }

    fn requires_ground_truth(&self) -> bool {
        self.inner().requires_ground_truth()
    }

    fn compute(&self, inputs: &LossInputs<'_>) -> Result<Tensor> {
        self.inner().compute(inputs)
    }
}

/// Whether the trainer evaluates the model before calling the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateMode {
    /// The trainer computes `x_hat = model(y)` and passes it in.
    Pull,
    /// The loss evaluates the model itself.
    Push,
}

/// Ordered sum of loss terms.
///
/// # Example
///
/// ```rust
/// use candle_core::Device;
/// use sure_ei_rs::losses::{CompositeLoss, EstimateMode};
/// use sure_ei_rs::physics::PhysicsOperator;
/// use sure_ei_rs::RunConfig;
///
/// # fn main() -> sure_ei_rs::Result<()> {
/// let config = RunConfig::from_preset("sr-r2r")?;
/// let physics = PhysicsOperator::from_config(&config.physics, 0, &Device::Cpu)?;
/// let loss = CompositeLoss::from_config(&config.loss, &physics, 0)?;
/// assert_eq!(loss.estimate_mode(), EstimateMode::Push);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CompositeLoss {
    terms: Vec<LossTerm>,
    mode: EstimateMode,
}

impl CompositeLoss {
    /// Wrap an explicit list of terms.
    pub fn new(terms: Vec<LossTerm>) -> Result<Self> {
        if terms.is_empty() {
            return Err(RestoreError::config("a loss needs at least one term"));
        }
        let mode = if terms.iter().any(LossFunction::requires_estimate) {
            EstimateMode::Pull
        } else {
            EstimateMode::Push
        };
        Ok(Self { terms, mode })
    }

    /// Resolve the configured method into its terms.
    ///
    /// Each stochastic term draws from its own stream of `seed`; stream 0
    /// is left to the physics noise model.
    pub fn from_config(config: &LossConfig, physics: &PhysicsOperator, seed: u64) -> Result<Self> {
        let stream = |i: u64| NoiseSource::with_stream(seed, i);
        let noise_sigma = || {
            physics.sigma().ok_or_else(|| {
                RestoreError::config(format!(
                    "method {:?} requires a physics operator with a Gaussian noise model",
                    config.method
                ))
            })
        };
        let equivariant = |source: NoiseSource| -> Result<EquivariantLoss> {
            let kind = config.resolved_transform().ok_or_else(|| {
                RestoreError::config(format!("method {:?} has no transform", config.method))
            })?;
            EquivariantLoss::new(
                Transform::from_kind(kind, config.scale_antialias),
                config.alpha_tradeoff,
                config.stop_gradient,
                config.ei_apply_noise,
                source,
            )
        };

        let terms = match (config.method, config.sure_alternative) {
            (Method::Sup | Method::Css | Method::Noise2inverse, None) => {
                vec![LossTerm::Supervised(SupervisedLoss)]
            }
            (Method::Sure, None) => {
                noise_sigma()?;
                vec![LossTerm::Sure(SureLoss::from_config(config, physics, stream(1))?)]
            }
            (Method::Proposed | Method::EiRotate | Method::EiShift, None) => {
                noise_sigma()?;
                vec![
                    LossTerm::Sure(SureLoss::from_config(config, physics, stream(1))?),
                    LossTerm::Equivariant(equivariant(stream(2))?),
                ]
            }
            (Method::Proposed, Some(SureAlternative::R2r)) => {
                let sigma = noise_sigma()?;
                vec![LossTerm::R2rEquivariant(R2rEquivariantLoss::new(
                    sigma,
                    config.r2r_alpha,
                    equivariant(stream(2))?,
                    stream(1),
                )?)]
            }
            (method, Some(alternative)) => {
                return Err(RestoreError::config(format!(
                    "{alternative:?} cannot replace SURE for method {method:?}"
                )))
            }
        };

        let composite = Self::new(terms)?;
        tracing::info!(
            "Loss {:?}: [{}] ({:?}, {} model evaluations per batch)",
            config.method,
            composite.term_names().join(", "),
            composite.estimate_mode(),
            composite.evaluations_per_batch()
        );
        Ok(composite)
    }

    /// Terms in evaluation order.
    pub fn terms(&self) -> &[LossTerm] {
        &self.terms
    }

    /// Term names in evaluation order.
    pub fn term_names(&self) -> Vec<&'static str> {
        self.terms.iter().map(LossFunction::name).collect()
    }

    /// Pull or push, fixed at construction.
    pub fn estimate_mode(&self) -> EstimateMode {
        self.mode
    }

    /// Whether any term needs ground truth.
    pub fn requires_ground_truth(&self) -> bool {
        self.terms.iter().any(LossFunction::requires_ground_truth)
    }

    /// Extra model evaluations performed inside the loss per batch.
    pub fn model_evaluations(&self) -> usize {
        self.terms.iter().map(LossFunction::model_evaluations).sum()
    }

    /// Total model evaluations per batch, including the trainer's own.
    pub fn evaluations_per_batch(&self) -> usize {
        let pulled = usize::from(self.mode == EstimateMode::Pull);
        self.model_evaluations() + pulled
    }

    /// Random streams of every term, keyed `<index>.<name>.<k>`.
    pub fn noise_sources(&self) -> Vec<(String, &NoiseSource)> {
        self.terms
            .iter()
            .enumerate()
            .flat_map(|(i, term)| {
                term.noise_sources()
                    .into_iter()
                    .enumerate()
                    .map(move |(k, source)| (format!("{i}.{}.{k}", term.name()), source))
            })
            .collect()
    }

    /// Every term's value, in order.
    pub fn compute_terms(&self, inputs: &LossInputs<'_>) -> Result<Vec<Tensor>> {
        self.terms.iter().map(|term| term.compute(inputs)).collect()
    }

    /// Sum of all terms.
    pub fn compute(
        &self,
        x: Option<&Tensor>,
        x_hat: Option<&Tensor>,
        y: &Tensor,
        physics: &PhysicsOperator,
        model: &dyn RestorationModel,
    ) -> Result<Tensor> {
        let inputs = LossInputs {
            x,
            x_hat,
            y,
            physics,
            model,
        };
        let mut values = self.compute_terms(&inputs)?.into_iter();
        let first = values
            .next()
            .ok_or_else(|| RestoreError::training("composite loss has no terms"))?;
        values.try_fold(first, |acc, v| -> Result<Tensor> { Ok((acc + v)?) })
    }
}
