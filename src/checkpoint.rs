//! Training state persistence.
//!
//! A checkpoint is one safetensors file holding everything needed to resume
//! at the next epoch boundary:
//!
//! | Key                 | Content                          |
//! |---------------------|----------------------------------|
//! | `model.<name>`      | model parameters                 |
//! | `optim.m.<name>`    | Adam first moments               |
//! | `optim.v.<name>`    | Adam second moments              |
//! | `optim.step`        | Adam step counter (i64)          |
//! | `optim.lr`          | current learning rate (f64)      |
//! | `sched.last_epoch`  | scheduler epoch counter (i64)    |
//! | `sched.base_lr`     | scheduler base rate (f64)        |
//! | `state.epoch`       | index of the completed epoch     |
//! | `rng.<stream>`      | random stream position (2 x i64) |
//!
//! Final weights are written separately and hold only the parameters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;

use crate::error::{RestoreError, Result};
use crate::optimizer::Adam;
use crate::physics::noise::NoiseSource;
use crate::scheduler::MultiStepLr;

const MODEL_PREFIX: &str = "model.";
const RNG_PREFIX: &str = "rng.";

/// Random streams persisted with a checkpoint, by name.
pub type NamedStreams<'a> = [(String, &'a NoiseSource)];

/// Checkpoint for the epoch with 0-based index `epoch`:
/// `<out>/checkpoints/ckp_<epoch+1:03>.safetensors`.
pub fn checkpoint_path(output_dir: &Path, epoch: usize) -> PathBuf {
    output_dir
        .join("checkpoints")
        .join(format!("ckp_{:03}.safetensors", epoch + 1))
}

/// Final weights: `<out>/weights.safetensors`.
pub fn weights_path(output_dir: &Path) -> PathBuf {
    output_dir.join("weights.safetensors")
}

/// Most recent checkpoint in `<out>/checkpoints`, if any.
pub fn latest_checkpoint(output_dir: &Path) -> Result<Option<PathBuf>> {
    let dir = output_dir.join("checkpoints");
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        let index = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("ckp_"))
            .and_then(|s| s.parse::<usize>().ok());
        if let Some(index) = index {
            if best.as_ref().map_or(true, |(b, _)| index > *b) {
                best = Some((index, path));
            }
        }
    }
    Ok(best.map(|(_, path)| path))
}

pub(crate) fn scalar_i64(value: i64) -> Result<Tensor> {
    Ok(Tensor::new(&[value], &Device::Cpu)?)
}

pub(crate) fn scalar_f64(value: f64) -> Result<Tensor> {
    Ok(Tensor::new(&[value], &Device::Cpu)?)
}

fn single(tensors: &HashMap<String, Tensor>, key: &str, dtype: DType) -> Result<Tensor> {
    let t = tensors
        .get(key)
        .ok_or_else(|| RestoreError::checkpoint(format!("missing '{key}'")))?;
    if t.elem_count() != 1 {
        return Err(RestoreError::checkpoint(format!(
            "'{key}' should hold one value, has shape {:?}",
            t.dims()
        )));
    }
    if t.dtype() != dtype {
        return Err(RestoreError::checkpoint(format!(
            "'{key}' should be {dtype:?}, is {:?}",
            t.dtype()
        )));
    }
    Ok(t.flatten_all()?.get(0)?)
}

pub(crate) fn read_i64(tensors: &HashMap<String, Tensor>, key: &str) -> Result<i64> {
    Ok(single(tensors, key, DType::I64)?.to_scalar::<i64>()?)
}

pub(crate) fn read_f64(tensors: &HashMap<String, Tensor>, key: &str) -> Result<f64> {
    Ok(single(tensors, key, DType::F64)?.to_scalar::<f64>()?)
}

/// A 128-bit stream position as its high and low 64-bit halves.
fn word_pos_tensor(word_pos: u128) -> Result<Tensor> {
    let halves = [(word_pos >> 64) as u64 as i64, word_pos as u64 as i64];
    Ok(Tensor::new(&halves, &Device::Cpu)?)
}

fn read_word_pos(tensors: &HashMap<String, Tensor>, key: &str) -> Result<u128> {
    let t = tensors
        .get(key)
        .ok_or_else(|| RestoreError::checkpoint(format!("missing '{key}'")))?;
    if t.dtype() != DType::I64 || t.elem_count() != 2 {
        return Err(RestoreError::checkpoint(format!(
            "'{key}' should hold two i64 values, has {:?} of shape {:?}",
            t.dtype(),
            t.dims()
        )));
    }
    let halves = t.flatten_all()?.to_vec1::<i64>()?;
    Ok(((halves[0] as u64 as u128) << 64) | halves[1] as u64 as u128)
}

fn model_tensors(var_map: &VarMap) -> Result<HashMap<String, Tensor>> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| RestoreError::training("variable map lock poisoned"))?;
    Ok(data
        .iter()
        .map(|(name, var)| (format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone()))
        .collect())
}

/// Write a full training state after epoch `epoch`.
pub fn save_checkpoint(
    path: &Path,
    epoch: usize,
    var_map: &VarMap,
    optimizer: &Adam,
    scheduler: &MultiStepLr,
    streams: &NamedStreams<'_>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tensors = model_tensors(var_map)?;
    tensors.extend(optimizer.state_tensors()?);
    tensors.extend(scheduler.state_tensors()?);
    tensors.insert("state.epoch".into(), scalar_i64(epoch as i64)?);
    for (name, source) in streams {
        tensors.insert(format!("{RNG_PREFIX}{name}"), word_pos_tensor(source.word_pos()?)?);
    }
    candle_core::safetensors::save(&tensors, path)?;
    tracing::info!("Saved checkpoint to: {}", path.display());
    Ok(())
}

/// Restore a full training state in place. Returns the completed epoch.
pub fn load_checkpoint(
    path: &Path,
    var_map: &VarMap,
    optimizer: &mut Adam,
    scheduler: &mut MultiStepLr,
    streams: &NamedStreams<'_>,
) -> Result<usize> {
    if !path.is_file() {
        return Err(RestoreError::checkpoint(format!(
            "checkpoint {} does not exist",
            path.display()
        )));
    }
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    {
        let data = var_map
            .data()
            .lock()
            .map_err(|_| RestoreError::training("variable map lock poisoned"))?;
        for (name, var) in data.iter() {
            let key = format!("{MODEL_PREFIX}{name}");
            let value = tensors.get(&key).ok_or_else(|| {
                RestoreError::checkpoint(format!("{} has no '{key}'", path.display()))
            })?;
            if value.dims() != var.dims() {
                return Err(RestoreError::shape(
                    format!("{key} of shape {:?}", var.dims()),
                    format!("{:?}", value.dims()),
                ));
            }
            var.set(&value.to_device(var.device())?)?;
        }
    }
    optimizer.load_state(&tensors)?;
    scheduler.load_state(&tensors)?;
    for (name, source) in streams {
        source.set_word_pos(read_word_pos(&tensors, &format!("{RNG_PREFIX}{name}"))?)?;
    }
    let epoch = read_i64(&tensors, "state.epoch")?;
    let epoch = usize::try_from(epoch)
        .map_err(|_| RestoreError::checkpoint(format!("invalid epoch {epoch}")))?;
    tracing::info!(
        "Loaded checkpoint from: {} (epoch={}, step={})",
        path.display(),
        epoch + 1,
        optimizer.step_count()
    );
    Ok(epoch)
}
