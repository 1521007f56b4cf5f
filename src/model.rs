//! Reconstruction networks.
//!
//! The training core only needs a differentiable `forward` and access to the
//! trainable variables, expressed by [`RestorationModel`]. Three reference
//! networks are provided: the identity, nearest-neighbour upsampling and a
//! small residual CNN.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder, VarMap};

use crate::config::{ModelConfig, ModelKind, PhysicsConfig, Task};
use crate::error::{RestoreError, Result};
use crate::physics::padding::image_dims;

/// Channels of every image batch.
pub const IMAGE_CHANNELS: usize = 3;

/// A trainable map from measurements to signal estimates.
pub trait RestorationModel {
    /// Differentiable `x_hat = model(y)`.
    fn forward(&self, y: &Tensor) -> Result<Tensor>;

    /// Trainable variables, keyed by name.
    fn var_map(&self) -> &VarMap;
}

/// Returns the measurement unchanged.
pub struct IdentityModel {
    var_map: VarMap,
}

impl IdentityModel {
    /// Create the model.
    pub fn new() -> Self {
        Self {
            var_map: VarMap::new(),
        }
    }
}

impl Default for IdentityModel {
    fn default() -> Self {
        Self::new()
    }
}

impl RestorationModel for IdentityModel {
    fn forward(&self, y: &Tensor) -> Result<Tensor> {
        Ok(y.clone())
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }
}

/// Nearest-neighbour upsampling by a fixed factor.
pub struct UpsampleModel {
    factor: usize,
    var_map: VarMap,
}

impl UpsampleModel {
    /// Create the model.
    pub fn new(factor: usize) -> Result<Self> {
        if factor == 0 {
            return Err(RestoreError::validation("upsampling factor must be positive"));
        }
        Ok(Self {
            factor,
            var_map: VarMap::new(),
        })
    }
}

impl RestorationModel for UpsampleModel {
    fn forward(&self, y: &Tensor) -> Result<Tensor> {
        upsample(y, self.factor)
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }
}

fn upsample(y: &Tensor, factor: usize) -> Result<Tensor> {
    let (_, _, h, w) = image_dims(y, "model input")?;
    if factor == 1 {
        return Ok(y.clone());
    }
    Ok(y.upsample_nearest2d(h * factor, w * factor)?)
}

/// Small residual CNN.
///
/// `head -> relu -> (conv -> relu) x blocks -> tail`, all 3x3 with zero
/// padding, applied after nearest upsampling for super-resolution. With
/// `residual` the upsampled input is added to the output.
pub struct ConvNet {
    head: Conv2d,
    body: Vec<Conv2d>,
    tail: Conv2d,
    upscale: usize,
    residual: bool,
    var_map: VarMap,
}

impl ConvNet {
    /// Randomly initialised network on `device`.
    pub fn new(config: &ModelConfig, upscale: usize, device: &Device) -> Result<Self> {
        if config.hidden_channels == 0 {
            return Err(RestoreError::validation("hidden_channels must be positive"));
        }
        if upscale == 0 {
            return Err(RestoreError::validation("upsampling factor must be positive"));
        }
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let conv = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let hidden = config.hidden_channels;

        let head = candle_nn::conv2d(IMAGE_CHANNELS, hidden, 3, conv, vb.pp("head"))?;
        let body = (0..config.num_conv_blocks)
            .map(|i| candle_nn::conv2d(hidden, hidden, 3, conv, vb.pp(format!("body.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let tail = candle_nn::conv2d(hidden, IMAGE_CHANNELS, 3, conv, vb.pp("tail"))?;

        Ok(Self {
            head,
            body,
            tail,
            upscale,
            residual: config.residual,
            var_map,
        })
    }
}

impl RestorationModel for ConvNet {
    fn forward(&self, y: &Tensor) -> Result<Tensor> {
        let x = upsample(y, self.upscale)?;
        let mut h = self.head.forward(&x)?.relu()?;
        for conv in &self.body {
            h = conv.forward(&h)?.relu()?;
        }
        let out = self.tail.forward(&h)?;
        if self.residual {
            Ok((out + x)?)
        } else {
            Ok(out)
        }
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }
}

/// Build the configured network for a task.
pub fn build_model(
    config: &ModelConfig,
    physics: &PhysicsConfig,
    device: &Device,
) -> Result<Box<dyn RestorationModel>> {
    let upscale = match physics.task {
        Task::SuperResolution => physics
            .sr_factor
            .ok_or_else(|| RestoreError::config("super-resolution requires sr_factor"))?,
        Task::Deblurring => 1,
    };
    let model: Box<dyn RestorationModel> = match config.kind {
        ModelKind::Id => Box::new(IdentityModel::new()),
        ModelKind::Up => Box::new(UpsampleModel::new(upscale)?),
        ModelKind::Cnn => Box::new(ConvNet::new(config, upscale, device)?),
    };
    tracing::info!(
        "Model {:?}: {} trainable parameters",
        config.kind,
        parameter_count(model.var_map())
    );
    Ok(model)
}

/// Total number of trainable scalars.
pub fn parameter_count(var_map: &VarMap) -> usize {
    var_map.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// Write every variable to a safetensors file.
pub fn save_weights(var_map: &VarMap, path: &Path) -> Result<()> {
    var_map.save(path)?;
    Ok(())
}

/// Overwrite every variable with the tensor of the same name in `path`.
///
/// Missing names and shape mismatches are errors; extra tensors in the file
/// are ignored.
pub fn load_weights(var_map: &VarMap, path: &Path) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let data = var_map
        .data()
        .lock()
        .map_err(|_| RestoreError::training("variable map lock poisoned"))?;
    for (name, var) in data.iter() {
        let value = tensors.get(name).ok_or_else(|| {
            RestoreError::checkpoint(format!("{} has no tensor '{name}'", path.display()))
        })?;
        if value.dims() != var.dims() {
            return Err(RestoreError::shape(
                format!("{name} of shape {:?}", var.dims()),
                format!("{:?}", value.dims()),
            ));
        }
        var.set(&value.to_device(var.device())?.to_dtype(var.dtype())?)?;
    }
    Ok(())
}
