//! Adam over a [`VarMap`].
//!
//! Moments are kept per variable name so they can be written to and restored
//! from a checkpoint alongside the parameters.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::VarMap;

use crate::checkpoint::{read_f64, read_i64, scalar_f64, scalar_i64};
use crate::config::TrainingConfig;
use crate::error::{RestoreError, Result};

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1
    pub beta1: f64,
    /// Beta2
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl AdamConfig {
    /// Hyperparameters from the training section and a resolved learning rate.
    pub fn from_training(config: &TrainingConfig, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
        }
    }
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-4,
            beta1: 0.9,
            beta2: 0.99,
            eps: 1e-8,
        }
    }
}

/// Adam without weight decay.
pub struct Adam {
    config: AdamConfig,
    vars: Vec<(String, Var)>,
    /// First moment estimates
    m: HashMap<String, Tensor>,
    /// Second moment estimates
    v: HashMap<String, Tensor>,
    /// Step counter for bias correction
    t: usize,
}

impl Adam {
    /// Track every variable currently in `var_map`.
    pub fn new(var_map: &VarMap, config: AdamConfig) -> Result<Self> {
        let data = var_map
            .data()
            .lock()
            .map_err(|_| RestoreError::training("variable map lock poisoned"))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            config,
            vars,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        })
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> usize {
        self.t
    }

    /// Apply one update from `grads`. Variables without a gradient keep
    /// their value and moments.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.t += 1;
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            eps,
        } = self.config;

        // Bias correction factors
        let bc1 = 1.0 - beta1.powi(self.t as i32);
        let bc2 = 1.0 - beta2.powi(self.t as i32);

        for (name, var) in &self.vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let zeros = || Tensor::zeros(var.dims(), DType::F32, var.device());
            let m = match self.m.get(name) {
                Some(m) => m.clone(),
                None => zeros()?,
            };
            let v = match self.v.get(name) {
                Some(v) => v.clone(),
                None => zeros()?,
            };

            // m = b1 m + (1 - b1) g, v = b2 v + (1 - b2) g^2
            let m_new = ((m * beta1)? + (grad * (1.0 - beta1))?)?;
            let v_new = ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&m_new / bc1)?;
            let v_hat = (&v_new / bc2)?;
            let update = ((m_hat / (v_hat.sqrt()? + eps)?)? * learning_rate)?;
            var.set(&(var.as_tensor() - update)?)?;

            self.m.insert(name.clone(), m_new);
            self.v.insert(name.clone(), v_new);
        }
        Ok(())
    }

    /// Optimizer state as named tensors: `optim.m.<var>`, `optim.v.<var>`,
    /// `optim.step` and `optim.lr`.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        for (name, m) in &self.m {
            tensors.insert(format!("optim.m.{name}"), m.clone());
        }
        for (name, v) in &self.v {
            tensors.insert(format!("optim.v.{name}"), v.clone());
        }
        tensors.insert("optim.step".into(), scalar_i64(self.t as i64)?);
        tensors.insert("optim.lr".into(), scalar_f64(self.config.learning_rate)?);
        Ok(tensors)
    }

    /// Restore state written by [`Adam::state_tensors`].
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let step = read_i64(tensors, "optim.step")?;
        self.t = usize::try_from(step)
            .map_err(|_| RestoreError::checkpoint(format!("invalid optimizer step {step}")))?;
        self.config.learning_rate = read_f64(tensors, "optim.lr")?;
        self.m.clear();
        self.v.clear();
        for (name, var) in &self.vars {
            for (prefix, store) in [("optim.m", &mut self.m), ("optim.v", &mut self.v)] {
                if let Some(t) = tensors.get(&format!("{prefix}.{name}")) {
                    if t.dims() != var.dims() {
                        return Err(RestoreError::shape(
                            format!("{prefix}.{name} of shape {:?}", var.dims()),
                            format!("{:?}", t.dims()),
                        ));
                    }
                    store.insert(name.clone(), t.to_device(var.device())?);
                }
            }
        }
        Ok(())
    }
}
