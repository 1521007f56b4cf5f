//! Anti-aliased decimation by an integer factor.

use candle_core::{Device, Tensor};

use super::blur::correlate_circular;
use super::kernels::Kernel;
use super::padding::image_dims;
use crate::config::DownsamplingFilter;
use crate::error::{RestoreError, Result};

/// Filter-then-decimate operator.
///
/// `apply` keeps every `factor`-th sample of the circularly filtered image.
/// The adjoint is either the exact transpose (zero insertion followed by
/// correlation with the flipped filter) or nearest-neighbour upsampling.
#[derive(Debug)]
pub struct Downsampling {
    factor: usize,
    filter_kind: DownsamplingFilter,
    kernel: Kernel,
    filter: Tensor,
    flipped: Tensor,
    true_adjoint: bool,
}

impl Downsampling {
    /// Build the operator and upload its filter.
    pub fn new(
        factor: usize,
        filter_kind: DownsamplingFilter,
        true_adjoint: bool,
        device: &Device,
    ) -> Result<Self> {
        let kernel = match filter_kind {
            DownsamplingFilter::Bicubic => Kernel::bicubic_downsampling(factor)?,
            DownsamplingFilter::Bilinear => Kernel::bilinear_downsampling(factor)?,
            DownsamplingFilter::Gaussian => Kernel::gaussian_downsampling(factor)?,
            DownsamplingFilter::Box => Kernel::box_downsampling(factor)?,
        };
        let filter = kernel.to_tensor(device)?;
        let flipped = kernel.flipped().to_tensor(device)?;
        Ok(Self {
            factor,
            filter_kind,
            kernel,
            filter,
            flipped,
            true_adjoint,
        })
    }

    /// Decimation factor.
    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Filter family.
    pub fn filter_kind(&self) -> DownsamplingFilter {
        self.filter_kind
    }

    /// Anti-aliasing filter.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Whether `adjoint` is the exact transpose.
    pub fn is_true_adjoint(&self) -> bool {
        self.true_adjoint
    }

    /// `A x`: output is `(h / factor, w / factor)`.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = image_dims(x, "signal")?;
        if h % self.factor != 0 || w % self.factor != 0 {
            return Err(RestoreError::shape(
                format!("spatial size divisible by {}", self.factor),
                format!("{h}x{w}"),
            ));
        }
        if self.kernel.height() > h || self.kernel.width() > w {
            return Err(RestoreError::shape(
                format!(
                    "image of at least {}x{}",
                    self.kernel.height(),
                    self.kernel.width()
                ),
                format!("{h}x{w}"),
            ));
        }
        correlate_circular(x, &self.filter, self.kernel.anchor(), self.factor)
    }

    /// Exact transpose or approximate inverse of `apply`.
    pub fn adjoint(&self, y: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = image_dims(y, "measurement")?;
        let f = self.factor;
        if !self.true_adjoint {
            return Ok(y.upsample_nearest2d(h * f, w * f)?);
        }
        let upsampled = if f == 1 {
            y.clone()
        } else {
            y.reshape((b, c, h, 1, w, 1))?
                .pad_with_zeros(3, 0, f - 1)?
                .pad_with_zeros(5, 0, f - 1)?
                .reshape((b, c, h * f, w * f))?
        };
        let (ah, aw) = self.kernel.anchor();
        let anchor = (self.kernel.height() - 1 - ah, self.kernel.width() - 1 - aw);
        correlate_circular(&upsampled, &self.flipped, anchor, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_output_shape() {
        let op = Downsampling::new(2, DownsamplingFilter::Bicubic, false, &Device::Cpu).unwrap();
        let x = Tensor::zeros((2, 3, 16, 12), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(op.apply(&x).unwrap().dims(), &[2, 3, 8, 6]);
        let y = Tensor::zeros((2, 3, 8, 6), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(op.adjoint(&y).unwrap().dims(), &[2, 3, 16, 12]);
    }

    #[test]
    fn test_indivisible_size_is_shape_error() {
        let op = Downsampling::new(3, DownsamplingFilter::Box, true, &Device::Cpu).unwrap();
        let x = Tensor::zeros((1, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(op.apply(&x), Err(RestoreError::Shape { .. })));
    }

    #[test]
    fn test_box_filter_averages_cells() {
        let op = Downsampling::new(2, DownsamplingFilter::Box, true, &Device::Cpu).unwrap();
        // box of size 2 is anchored at 1: out[i] = (x[2i - 1] + x[2i]) / 2 per axis
        let x = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let y = op.apply(&x).unwrap();
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }
}
