//! Blur and anti-aliasing kernels.
//!
//! Kernels live on the host as row-major `f32` data and are uploaded once
//! when an operator is built. The anchor of a kernel of size `k` is `k / 2`;
//! the flipped kernel has anchor `k - 1 - k / 2`, which makes correlation with
//! it the exact transpose of correlation with the original.

use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::error::{RestoreError, Result};

/// A 2-D filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    data: Vec<f32>,
    height: usize,
    width: usize,
}

impl Kernel {
    /// Wrap row-major data.
    pub fn new(data: Vec<f32>, height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(RestoreError::kernel("kernel must be non-empty"));
        }
        if data.len() != height * width {
            return Err(RestoreError::kernel(format!(
                "kernel data has {} values, expected {height}x{width}",
                data.len()
            )));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(RestoreError::kernel("kernel contains non-finite values"));
        }
        Ok(Self {
            data,
            height,
            width,
        })
    }

    /// Scale so the taps sum to one.
    pub fn normalized(mut self) -> Result<Self> {
        let sum: f64 = self.data.iter().map(|&v| f64::from(v)).sum();
        if sum.abs() < 1e-12 {
            return Err(RestoreError::kernel("kernel sums to zero"));
        }
        for v in &mut self.data {
            *v = (f64::from(*v) / sum) as f32;
        }
        Ok(self)
    }

    fn separable(weights: &[f64]) -> Result<Self> {
        let n = weights.len();
        let data = (0..n * n)
            .map(|i| (weights[i / n] * weights[i % n]) as f32)
            .collect();
        Self::new(data, n, n)?.normalized()
    }

    /// Uniform `size x size` average.
    pub fn box_filter(size: usize) -> Result<Self> {
        Self::separable(&vec![1.0; size])
    }

    /// Isotropic Gaussian with support `2 * ceil(3 sigma) + 1`.
    pub fn gaussian(sigma: f64) -> Result<Self> {
        if !(sigma > 0.0) {
            return Err(RestoreError::kernel(format!(
                "gaussian sigma must be positive, got {sigma}"
            )));
        }
        let radius = (3.0 * sigma).ceil() as isize;
        let weights: Vec<f64> = (-radius..=radius)
            .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
            .collect();
        Self::separable(&weights)
    }

    /// Horizontal motion blur of `length` pixels.
    pub fn motion(length: usize) -> Result<Self> {
        Self::new(vec![1.0; length], 1, length)?.normalized()
    }

    /// Radially symmetric Hann-windowed sinc low-pass on a 9x9 support,
    /// mimicking the band limit of a CT acquisition.
    pub fn ct_like() -> Result<Self> {
        const RADIUS: isize = 4;
        let cutoff = 0.5;
        let window = (RADIUS + 1) as f64;
        let size = (2 * RADIUS + 1) as usize;
        let mut data = Vec::with_capacity(size * size);
        for i in -RADIUS..=RADIUS {
            for j in -RADIUS..=RADIUS {
                let r = ((i * i + j * j) as f64).sqrt();
                let sinc = if r == 0.0 {
                    1.0
                } else {
                    (PI * cutoff * r).sin() / (PI * cutoff * r)
                };
                let hann = if r < window {
                    0.5 + 0.5 * (PI * r / window).cos()
                } else {
                    0.0
                };
                data.push((sinc * hann) as f32);
            }
        }
        Self::new(data, size, size)?.normalized()
    }

    /// Keys cubic anti-aliasing filter for decimation by `factor`.
    pub fn bicubic_downsampling(factor: usize) -> Result<Self> {
        check_factor(factor)?;
        let f = factor as f64;
        let weights: Vec<f64> = (0..4 * factor)
            .map(|i| cubic((i as f64 - 2.0 * f + 0.5) / f))
            .collect();
        Self::separable(&weights)
    }

    /// Triangle anti-aliasing filter for decimation by `factor`.
    pub fn bilinear_downsampling(factor: usize) -> Result<Self> {
        check_factor(factor)?;
        let f = factor as f64;
        let weights: Vec<f64> = (0..2 * factor)
            .map(|i| (1.0 - ((i as f64 - f + 0.5) / f).abs()).max(0.0))
            .collect();
        Self::separable(&weights)
    }

    /// Gaussian anti-aliasing filter with `sigma = factor`.
    pub fn gaussian_downsampling(factor: usize) -> Result<Self> {
        check_factor(factor)?;
        Self::gaussian(factor as f64)
    }

    /// Cell-average filter for decimation by `factor`.
    pub fn box_downsampling(factor: usize) -> Result<Self> {
        check_factor(factor)?;
        Self::box_filter(factor)
    }

    /// Procedural kernel by name: `box_<size>`, `gaussian_<sigma>`,
    /// `motion_<length>` or `ct_like`.
    pub fn from_name(name: &str) -> Result<Self> {
        let lower = name.to_ascii_lowercase();
        if lower == "ct_like" {
            return Self::ct_like();
        }
        let unknown = || {
            RestoreError::config(format!(
                "kernel '{name}' is neither an existing file nor a known generator \
                 (box_<size>, gaussian_<sigma>, motion_<length>, ct_like)"
            ))
        };
        let (family, param) = lower.split_once('_').ok_or_else(unknown)?;
        match family {
            "box" => {
                let size = param.parse::<usize>().map_err(|_| unknown())?;
                Self::box_filter(size)
            }
            "gaussian" => {
                let sigma = param.parse::<f64>().map_err(|_| unknown())?;
                Self::gaussian(sigma)
            }
            "motion" => {
                let length = param.parse::<usize>().map_err(|_| unknown())?;
                Self::motion(length)
            }
            _ => Err(unknown()),
        }
    }

    /// Load a kernel tensor from a safetensors file.
    ///
    /// Uses the tensor named `kernel`, or the only tensor in the file.
    /// Leading singleton dimensions are dropped.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let tensor = match tensors.remove("kernel") {
            Some(t) => t,
            None if tensors.len() == 1 => tensors
                .into_values()
                .next()
                .ok_or_else(|| RestoreError::kernel("empty kernel file"))?,
            None => {
                return Err(RestoreError::kernel(format!(
                    "{} holds {} tensors and none is named 'kernel'",
                    path.display(),
                    tensors.len()
                )))
            }
        };
        let mut tensor = tensor.to_dtype(DType::F32)?;
        while tensor.rank() > 2 && tensor.dim(0)? == 1 {
            tensor = tensor.squeeze(0)?;
        }
        if tensor.rank() != 2 {
            return Err(RestoreError::kernel(format!(
                "expected a 2-D kernel, got shape {:?}",
                tensor.dims()
            )));
        }
        let (height, width) = tensor.dims2()?;
        let data = tensor.flatten_all()?.to_vec1::<f32>()?;
        Self::new(data, height, width)
    }

    /// Kernel height.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Kernel width.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Largest spatial extent.
    pub fn support(&self) -> usize {
        self.height.max(self.width)
    }

    /// Tap at `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.width + col]
    }

    /// Anchor (row, col) used by correlation.
    pub fn anchor(&self) -> (usize, usize) {
        (self.height / 2, self.width / 2)
    }

    /// Kernel rotated by 180 degrees.
    pub fn flipped(&self) -> Self {
        let mut data = self.data.clone();
        data.reverse();
        Self {
            data,
            height: self.height,
            width: self.width,
        }
    }

    /// Upload as a `(1, 1, h, w)` tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.data.clone(),
            (1, 1, self.height, self.width),
            device,
        )?)
    }
}

fn check_factor(factor: usize) -> Result<()> {
    if factor == 0 {
        return Err(RestoreError::validation("downsampling factor must be positive"));
    }
    Ok(())
}

/// Keys cubic convolution kernel with a = -0.5.
pub(crate) fn cubic(x: f64) -> f64 {
    let a = -0.5;
    let x = x.abs();
    if x <= 1.0 {
        (a + 2.0) * x.powi(3) - (a + 3.0) * x.powi(2) + 1.0
    } else if x < 2.0 {
        a * x.powi(3) - 5.0 * a * x.powi(2) + 8.0 * a * x - 4.0 * a
    } else {
        0.0
    }
}

/// Where a deblurring kernel comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelSource {
    /// The synthetic CT-like filter.
    CtLike,
    /// A precomputed kernel on disk.
    File(PathBuf),
    /// A named generator.
    Procedural(String),
}

impl KernelSource {
    /// Classify a kernel specification. Existing paths win over names.
    pub fn resolve(spec: &str) -> Self {
        if spec.eq_ignore_ascii_case("ct_like") {
            Self::CtLike
        } else if Path::new(spec).exists() {
            Self::File(PathBuf::from(spec))
        } else {
            Self::Procedural(spec.to_string())
        }
    }

    /// Produce the kernel.
    pub fn load(&self) -> Result<Kernel> {
        match self {
            Self::CtLike => Kernel::ct_like(),
            Self::File(path) => Kernel::from_file(path),
            Self::Procedural(name) => Kernel::from_name(name),
        }
    }
}
