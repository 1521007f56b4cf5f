//! Learning rate schedulers.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::checkpoint::{read_f64, read_i64, scalar_f64, scalar_i64};
use crate::error::{RestoreError, Result};
use crate::optimizer::Adam;

/// Step decay at fixed epochs.
///
/// After `last_epoch` epochs the rate is `base_lr * gamma^k`, where `k` is
/// the number of milestones `<= last_epoch`.
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    last_epoch: usize,
}

impl MultiStepLr {
    /// Create a new scheduler.
    pub fn new(base_lr: f64, milestones: Vec<usize>, gamma: f64) -> Self {
        Self {
            base_lr,
            milestones,
            gamma,
            last_epoch: 0,
        }
    }

    /// Get learning rate for the current epoch.
    pub fn get_lr(&self) -> f64 {
        let passed = self
            .milestones
            .iter()
            .filter(|&&m| m <= self.last_epoch)
            .count();
        self.base_lr * self.gamma.powi(passed as i32)
    }

    /// Epochs stepped so far.
    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut Adam) {
        self.last_epoch += 1;
        let lr = self.get_lr();
        if lr != optimizer.learning_rate() {
            tracing::info!("Learning rate -> {:.3e} at epoch {}", lr, self.last_epoch);
        }
        optimizer.set_learning_rate(lr);
    }

    /// Scheduler state: `sched.last_epoch` and `sched.base_lr`.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        tensors.insert("sched.last_epoch".into(), scalar_i64(self.last_epoch as i64)?);
        tensors.insert("sched.base_lr".into(), scalar_f64(self.base_lr)?);
        Ok(tensors)
    }

    /// Restore state written by [`MultiStepLr::state_tensors`].
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let last_epoch = read_i64(tensors, "sched.last_epoch")?;
        self.last_epoch = usize::try_from(last_epoch).map_err(|_| {
            RestoreError::checkpoint(format!("invalid scheduler epoch {last_epoch}"))
        })?;
        self.base_lr = read_f64(tensors, "sched.base_lr")?;
        Ok(())
    }
}
