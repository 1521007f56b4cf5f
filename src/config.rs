//! Configuration parsing and validation.
//!
//! A run is described by one immutable [`RunConfig`], usually read from YAML.
//! Each component receives only the section it needs when it is built.

use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{RestoreError, Result};

/// Main configuration for a training run.
///
/// # Example
///
/// ```rust
/// use sure_ei_rs::RunConfig;
///
/// # fn main() -> sure_ei_rs::Result<()> {
/// let config = RunConfig::from_preset("deblur-sure")?;
/// config.validate()?;
/// assert_eq!(config.training.batch_size, 8);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Forward operator configuration.
    pub physics: PhysicsConfig,

    /// Loss selection and hyperparameters.
    pub loss: LossConfig,

    /// Optimisation, scheduling and checkpointing.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Reconstruction network.
    #[serde(default)]
    pub model: ModelConfig,

    /// Training data.
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// Output directory for checkpoints and final weights.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed for noise, transforms and shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Compute target (`cpu`, `cuda`, `cuda:<n>`, `metal`, `metal:<n>`).
    #[serde(default = "default_device")]
    pub device: String,

    /// Extra targets for data-parallel replication. Accepted for
    /// compatibility; the model always runs on `device`.
    #[serde(default)]
    pub data_parallel_devices: Vec<String>,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    0
}

fn default_device() -> String {
    "cpu".into()
}

fn default_true() -> bool {
    true
}

/// Restoration task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Circular blur followed by Gaussian noise.
    #[serde(rename = "deblurring")]
    Deblurring,
    /// Anti-aliased downsampling followed by Gaussian noise.
    #[serde(rename = "sr", alias = "super-resolution")]
    SuperResolution,
}

/// Interpolation filter applied before decimation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownsamplingFilter {
    /// Keys cubic kernel with a = -0.5.
    #[default]
    Bicubic,
    /// Triangle kernel.
    Bilinear,
    /// Gaussian with standard deviation equal to the factor.
    Gaussian,
    /// Plain averaging over each factor x factor cell.
    Box,
}

/// Physics (forward operator) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicsConfig {
    /// Restoration task.
    pub task: Task,

    /// Noise level on the 0-255 scale; sigma = noise_level / 255.
    /// Absent means the operator has no noise model.
    #[serde(default)]
    pub noise_level: Option<f64>,

    /// Kernel source for deblurring: a safetensors path, a procedural
    /// name (`box_3`, `gaussian_1.6`, `motion_7`) or `ct_like`.
    #[serde(default)]
    pub kernel: Option<String>,

    /// Super-resolution factor.
    #[serde(default)]
    pub sr_factor: Option<usize>,

    /// Downsampling filter.
    #[serde(default)]
    pub sr_filter: DownsamplingFilter,

    /// Use the exact transpose as the adjoint of the downsampling operator.
    #[serde(default)]
    pub true_adjoint: bool,
}

impl PhysicsConfig {
    /// Gaussian noise standard deviation, if a noise model is configured.
    pub fn sigma(&self) -> Option<f64> {
        self.noise_level.map(|level| level / 255.0)
    }
}

/// Training method, mapped to an ordered list of loss terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    /// SURE + scale-equivariant imaging (or R2R-EI).
    Proposed,
    /// Supervised.
    Sup,
    /// Supervised on noisy targets.
    Css,
    /// SURE only.
    Sure,
    /// SURE + rotation-equivariant imaging.
    EiRotate,
    /// SURE + shift-equivariant imaging.
    EiShift,
    /// Supervised on pseudo targets.
    Noise2inverse,
}

impl Method {
    /// Whether the method trains without ground truth.
    pub fn is_self_supervised(self) -> bool {
        matches!(
            self,
            Method::Proposed | Method::Sure | Method::EiRotate | Method::EiShift
        )
    }
}

/// Alternative to SURE for the proposed method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SureAlternative {
    /// Recorrupted-to-recorrupted combined with the equivariant term.
    R2r,
}

/// Transform group used by equivariant losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    /// Rotation by multiples of 90 degrees.
    Rotate,
    /// Circular translation.
    Shift,
    /// Rescaling about a random centre.
    Scale,
    /// No-op, useful for checks.
    Identity,
}

/// Loss settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    /// Training method.
    pub method: Method,

    /// Block gradients through the transformed reference of the EI term.
    #[serde(default = "default_true")]
    pub stop_gradient: bool,

    /// Override the method's transform.
    #[serde(default)]
    pub transform: Option<TransformKind>,

    /// Weight of the equivariant term.
    #[serde(default = "default_alpha_tradeoff")]
    pub alpha_tradeoff: f64,

    /// Antialias the scale transform when shrinking.
    #[serde(default)]
    pub scale_antialias: bool,

    /// Replace SURE + EI by R2R-EI in the proposed method.
    #[serde(default)]
    pub sure_alternative: Option<SureAlternative>,

    /// Monte-Carlo step for the SURE divergence.
    #[serde(default = "default_tau")]
    pub tau: f64,

    /// Explicit per-side margin excluded from the SURE residual.
    #[serde(default)]
    pub sure_margin: Option<usize>,

    /// Derive the SURE margin from the operator when none is given.
    #[serde(default = "default_true")]
    pub partial_sure: bool,

    /// Use a margin of 2 for super-resolution when deriving it.
    #[serde(default)]
    pub partial_sure_sr: bool,

    /// Restrict the divergence average to the cropped region as well.
    #[serde(default = "default_true")]
    pub sure_cropped_div: bool,

    /// Add noise when pushing transformed estimates through the physics.
    #[serde(default = "default_true")]
    pub ei_apply_noise: bool,

    /// Re-noising strength of R2R.
    #[serde(default = "default_r2r_alpha")]
    pub r2r_alpha: f64,
}

fn default_alpha_tradeoff() -> f64 {
    1.0
}
fn default_tau() -> f64 {
    1e-2
}
fn default_r2r_alpha() -> f64 {
    0.5
}

impl LossConfig {
    /// Config for a method with every other field at its default.
    pub fn for_method(method: Method) -> Self {
        Self {
            method,
            stop_gradient: true,
            transform: None,
            alpha_tradeoff: default_alpha_tradeoff(),
            scale_antialias: false,
            sure_alternative: None,
            tau: default_tau(),
            sure_margin: None,
            partial_sure: true,
            partial_sure_sr: false,
            sure_cropped_div: true,
            ei_apply_noise: true,
            r2r_alpha: default_r2r_alpha(),
        }
    }

    /// Transform used by the equivariant term, if the method has one.
    pub fn resolved_transform(&self) -> Option<TransformKind> {
        let method_default = match self.method {
            Method::Proposed => Some(TransformKind::Scale),
            Method::EiRotate => Some(TransformKind::Rotate),
            Method::EiShift => Some(TransformKind::Shift),
            _ => None,
        };
        method_default.map(|kind| self.transform.unwrap_or(kind))
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Save a full training state every N epochs (and after the last one).
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    /// Learning rate; task default when absent.
    #[serde(default)]
    pub learning_rate: Option<f64>,

    /// Adam beta1.
    #[serde(default = "default_beta1")]
    pub beta1: f64,

    /// Adam beta2.
    #[serde(default = "default_beta2")]
    pub beta2: f64,

    /// Adam epsilon.
    #[serde(default = "default_eps")]
    pub eps: f64,

    /// Epochs at which the learning rate is multiplied by `gamma`.
    #[serde(default = "default_milestones")]
    pub milestones: Vec<usize>,

    /// Multiplicative decay at each milestone.
    #[serde(default = "default_gamma")]
    pub gamma: f64,

    /// Stop with an error when an epoch's mean loss is not finite.
    #[serde(default)]
    pub halt_on_divergence: bool,

    /// Draw a progress bar over the batches of each epoch.
    #[serde(default)]
    pub progress_bar: bool,
}

fn default_batch_size() -> usize {
    8
}
fn default_epochs() -> usize {
    500
}
fn default_checkpoint_interval() -> usize {
    50
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.99
}
fn default_eps() -> f64 {
    1e-8
}
fn default_milestones() -> Vec<usize> {
    vec![250, 400, 450, 475]
}
fn default_gamma() -> f64 {
    0.5
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            checkpoint_interval: default_checkpoint_interval(),
            learning_rate: None,
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            milestones: default_milestones(),
            gamma: default_gamma(),
            halt_on_divergence: false,
            progress_bar: false,
        }
    }
}

/// Reference network kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Returns the measurement unchanged.
    Id,
    /// Nearest-neighbour upsampling by the SR factor.
    Up,
    /// Small residual convolutional network.
    #[default]
    Cnn,
}

/// Reference network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Network kind.
    #[serde(default)]
    pub kind: ModelKind,

    /// Width of the hidden convolutions.
    #[serde(default = "default_hidden_channels")]
    pub hidden_channels: usize,

    /// Number of hidden 3x3 convolutions.
    #[serde(default = "default_num_conv_blocks")]
    pub num_conv_blocks: usize,

    /// Add the (upsampled) input to the output.
    #[serde(default = "default_true")]
    pub residual: bool,
}

fn default_hidden_channels() -> usize {
    32
}
fn default_num_conv_blocks() -> usize {
    4
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::Cnn,
            hidden_channels: default_hidden_channels(),
            num_conv_blocks: default_num_conv_blocks(),
            residual: true,
        }
    }
}

/// Training data settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Safetensors file holding `x` (clean images) and/or `y` (measurements).
    #[serde(default)]
    pub path: String,

    /// Keep clean images alongside simulated measurements.
    #[serde(default = "default_true")]
    pub keep_ground_truth: bool,
}

impl RunConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"deblur-sure"` - deblurring with a 9x9 Gaussian kernel, SURE only
    /// - `"sr-proposed"` - x2 super-resolution, SURE + scale EI
    /// - `"sr-r2r"` - x2 super-resolution, R2R + scale EI
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "deblur-sure" => Ok(Self::deblur_sure_preset()),
            "sr-proposed" => Ok(Self::sr_proposed_preset()),
            "sr-r2r" => {
                let mut config = Self::sr_proposed_preset();
                config.loss.sure_alternative = Some(SureAlternative::R2r);
                config.output_dir = "./outputs/sr-r2r".into();
                Ok(config)
            }
            _ => Err(RestoreError::config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Deblurring with SURE.
    #[must_use]
    pub fn deblur_sure_preset() -> Self {
        Self {
            physics: PhysicsConfig {
                task: Task::Deblurring,
                noise_level: Some(5.0),
                kernel: Some("gaussian_1.5".into()),
                sr_factor: None,
                sr_filter: DownsamplingFilter::Bicubic,
                true_adjoint: false,
            },
            loss: LossConfig::for_method(Method::Sure),
            training: TrainingConfig::default(),
            model: ModelConfig::default(),
            dataset: DatasetConfig {
                path: "./data/train.safetensors".into(),
                keep_ground_truth: true,
            },
            output_dir: "./outputs/deblur-sure".into(),
            seed: default_seed(),
            device: default_device(),
            data_parallel_devices: Vec::new(),
        }
    }

    /// x2 super-resolution with SURE + scale-equivariant imaging.
    #[must_use]
    pub fn sr_proposed_preset() -> Self {
        Self {
            physics: PhysicsConfig {
                task: Task::SuperResolution,
                noise_level: Some(5.0),
                kernel: None,
                sr_factor: Some(2),
                sr_filter: DownsamplingFilter::Bicubic,
                true_adjoint: false,
            },
            loss: LossConfig::for_method(Method::Proposed),
            training: TrainingConfig::default(),
            model: ModelConfig::default(),
            dataset: DatasetConfig {
                path: "./data/train.safetensors".into(),
                keep_ground_truth: true,
            },
            output_dir: "./outputs/sr-proposed".into(),
            seed: default_seed(),
            device: default_device(),
            data_parallel_devices: Vec::new(),
        }
    }

    /// Learning rate, falling back to the task default.
    pub fn learning_rate(&self) -> f64 {
        self.training
            .learning_rate
            .unwrap_or(match self.physics.task {
                Task::SuperResolution => 2e-4,
                Task::Deblurring => 5e-4,
            })
    }

    /// Parse the configured compute target.
    pub fn device(&self) -> Result<Device> {
        parse_device(&self.device)
    }

    /// Validate the configuration.
    ///
    /// Every check runs before any tensor is allocated.
    pub fn validate(&self) -> Result<()> {
        let physics = &self.physics;
        match physics.task {
            Task::Deblurring => {
                if physics.kernel.as_deref().map_or(true, str::is_empty) {
                    return Err(RestoreError::config(
                        "deblurring requires a kernel path or procedural kernel name",
                    ));
                }
            }
            Task::SuperResolution => match physics.sr_factor {
                None => {
                    return Err(RestoreError::config(
                        "super-resolution requires sr_factor",
                    ))
                }
                Some(0) => return Err(RestoreError::validation("sr_factor must be at least 1")),
                Some(_) => {}
            },
        }
        if let Some(level) = physics.noise_level {
            if !(level > 0.0) {
                return Err(RestoreError::validation(format!(
                    "noise_level must be positive, got {level}"
                )));
            }
        }

        let loss = &self.loss;
        if loss.method.is_self_supervised() && physics.noise_level.is_none() {
            return Err(RestoreError::config(format!(
                "method {:?} requires a Gaussian noise model (set physics.noise_level)",
                loss.method
            )));
        }
        if loss.sure_alternative.is_some() && loss.method != Method::Proposed {
            return Err(RestoreError::config(
                "sure_alternative is only supported by the proposed method",
            ));
        }
        if !(loss.tau > 0.0) {
            return Err(RestoreError::validation(format!(
                "tau must be positive, got {}",
                loss.tau
            )));
        }
        if !(loss.alpha_tradeoff >= 0.0) {
            return Err(RestoreError::validation(format!(
                "alpha_tradeoff must be non-negative, got {}",
                loss.alpha_tradeoff
            )));
        }
        if !(loss.r2r_alpha > 0.0) {
            return Err(RestoreError::validation(format!(
                "r2r_alpha must be positive, got {}",
                loss.r2r_alpha
            )));
        }
        if loss.partial_sure_sr
            && physics.task == Task::SuperResolution
            && physics.sr_filter != DownsamplingFilter::Bicubic
        {
            return Err(RestoreError::config(format!(
                "partial_sure_sr requires the bicubic filter, got {:?}",
                physics.sr_filter
            )));
        }
        if loss.sure_margin.is_some() && !loss.partial_sure {
            return Err(RestoreError::config(
                "sure_margin requires partial_sure to be enabled",
            ));
        }

        let training = &self.training;
        if training.batch_size == 0 {
            return Err(RestoreError::validation("batch_size must be positive"));
        }
        if training.epochs == 0 {
            return Err(RestoreError::validation("epochs must be positive"));
        }
        if training.checkpoint_interval == 0 {
            return Err(RestoreError::validation(
                "checkpoint_interval must be positive",
            ));
        }
        if !(self.learning_rate() > 0.0) {
            return Err(RestoreError::validation("learning_rate must be positive"));
        }
        if !(training.gamma > 0.0 && training.gamma <= 1.0) {
            return Err(RestoreError::validation(format!(
                "gamma must lie in (0, 1], got {}",
                training.gamma
            )));
        }
        if training.milestones.windows(2).any(|w| w[0] >= w[1]) {
            return Err(RestoreError::validation(
                "milestones must be strictly increasing",
            ));
        }

        if self.model.kind == ModelKind::Up && physics.task != Task::SuperResolution {
            return Err(RestoreError::config(
                "the upsampling model only applies to super-resolution",
            ));
        }

        validate_device_spec(&self.device)?;
        for spec in &self.data_parallel_devices {
            validate_device_spec(spec)?;
        }

        Ok(())
    }
}

fn split_device_spec(spec: &str) -> Result<(&str, usize)> {
    let (kind, ordinal) = match spec.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal = ordinal.parse::<usize>().map_err(|_| {
                RestoreError::config(format!("invalid device ordinal in '{spec}'"))
            })?;
            (kind, ordinal)
        }
        None => (spec, 0),
    };
    match kind {
        "cpu" | "cuda" | "metal" => Ok((kind, ordinal)),
        _ => Err(RestoreError::config(format!("unknown device '{spec}'"))),
    }
}

fn validate_device_spec(spec: &str) -> Result<()> {
    split_device_spec(spec).map(|_| ())
}

/// Parse a compute target identifier into a candle device.
pub fn parse_device(spec: &str) -> Result<Device> {
    let (kind, ordinal) = split_device_spec(spec)?;
    let device = match kind {
        "cuda" => Device::new_cuda(ordinal),
        "metal" => Device::new_metal(ordinal),
        _ => Ok(Device::Cpu),
    };
    device.map_err(|e| RestoreError::config(format!("device '{spec}' unavailable: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for preset in ["deblur-sure", "sr-proposed", "sr-r2r"] {
            let config = RunConfig::from_preset(preset).unwrap();
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_unknown_preset() {
        let err = RunConfig::from_preset("denoise").unwrap_err();
        assert!(matches!(err, RestoreError::Config(_)));
    }

    #[test]
    fn test_task_default_learning_rate() {
        assert_eq!(RunConfig::deblur_sure_preset().learning_rate(), 5e-4);
        assert_eq!(RunConfig::sr_proposed_preset().learning_rate(), 2e-4);

        let mut config = RunConfig::sr_proposed_preset();
        config.training.learning_rate = Some(1e-3);
        assert_eq!(config.learning_rate(), 1e-3);
    }

    #[test]
    fn test_yaml_minimal_config() {
        let yaml = r#"
physics:
  task: sr
  noise_level: 5
  sr_factor: 2
loss:
  method: ei-shift
training:
  epochs: 10
"#;
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.physics.task, Task::SuperResolution);
        assert_eq!(config.loss.method, Method::EiShift);
        assert_eq!(config.loss.resolved_transform(), Some(TransformKind::Shift));
        assert!(config.loss.stop_gradient);
        assert_eq!(config.training.milestones, vec![250, 400, 450, 475]);
        assert_eq!(config.training.checkpoint_interval, 50);
        assert_eq!(config.device, "cpu");
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let yaml = "physics:\n  task: sr\n  sr_factor: 2\nloss:\n  method: magic\n";
        let err = serde_yaml::from_str::<RunConfig>(yaml).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_unknown_task_is_rejected() {
        let yaml = "physics:\n  task: inpainting\nloss:\n  method: sup\n";
        assert!(serde_yaml::from_str::<RunConfig>(yaml).is_err());
    }

    #[test]
    fn test_deblurring_without_kernel() {
        let mut config = RunConfig::deblur_sure_preset();
        config.physics.kernel = None;
        assert!(matches!(config.validate(), Err(RestoreError::Config(_))));
    }

    #[test]
    fn test_non_positive_noise_level() {
        let mut config = RunConfig::deblur_sure_preset();
        config.physics.noise_level = Some(0.0);
        assert!(matches!(config.validate(), Err(RestoreError::Validation(_))));
    }

    #[test]
    fn test_self_supervised_requires_noise_model() {
        let mut config = RunConfig::deblur_sure_preset();
        config.physics.noise_level = None;
        assert!(matches!(config.validate(), Err(RestoreError::Config(_))));

        config.loss = LossConfig::for_method(Method::Sup);
        config.validate().unwrap();
    }

    #[test]
    fn test_non_positive_tau() {
        let mut config = RunConfig::deblur_sure_preset();
        config.loss.tau = 0.0;
        assert!(matches!(config.validate(), Err(RestoreError::Validation(_))));
    }

    #[test]
    fn test_r2r_only_for_proposed() {
        let mut config = RunConfig::deblur_sure_preset();
        config.loss.sure_alternative = Some(SureAlternative::R2r);
        assert!(matches!(config.validate(), Err(RestoreError::Config(_))));
    }

    #[test]
    fn test_partial_sure_sr_needs_bicubic() {
        let mut config = RunConfig::sr_proposed_preset();
        config.loss.partial_sure_sr = true;
        config.validate().unwrap();

        config.physics.sr_filter = DownsamplingFilter::Gaussian;
        assert!(matches!(config.validate(), Err(RestoreError::Config(_))));

        config.loss.partial_sure_sr = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_noise_level_to_sigma() {
        let mut physics = RunConfig::deblur_sure_preset().physics;
        assert_eq!(physics.sigma(), Some(5.0 / 255.0));
        physics.noise_level = None;
        assert_eq!(physics.sigma(), None);
    }

    #[test]
    fn test_transform_override() {
        let mut loss = LossConfig::for_method(Method::Proposed);
        assert_eq!(loss.resolved_transform(), Some(TransformKind::Scale));
        loss.transform = Some(TransformKind::Rotate);
        assert_eq!(loss.resolved_transform(), Some(TransformKind::Rotate));
        assert_eq!(LossConfig::for_method(Method::Sure).resolved_transform(), None);
    }

    #[test]
    fn test_device_parsing() {
        assert!(matches!(parse_device("cpu").unwrap(), Device::Cpu));
        assert!(matches!(parse_device("tpu:0"), Err(RestoreError::Config(_))));
        assert!(matches!(parse_device("cuda:x"), Err(RestoreError::Config(_))));

        let mut config = RunConfig::deblur_sure_preset();
        config.data_parallel_devices = vec!["gpu7".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        let config = RunConfig::sr_proposed_preset();
        config.to_file(&path).unwrap();
        let loaded = RunConfig::from_file(&path).unwrap();
        assert_eq!(loaded.physics.sr_factor, Some(2));
        assert_eq!(loaded.loss.method, Method::Proposed);
    }
}
