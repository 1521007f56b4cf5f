//! Circular blur.

use candle_core::{Device, Tensor};

use super::kernels::Kernel;
use super::padding::{image_dims, pad_circular};
use crate::error::Result;

/// Per-channel circular correlation with an uploaded `(1, 1, kh, kw)` filter
/// anchored at `anchor`, sampled every `stride` pixels.
pub(crate) fn correlate_circular(
    x: &Tensor,
    filter: &Tensor,
    anchor: (usize, usize),
    stride: usize,
) -> Result<Tensor> {
    let (_, channels, _, _) = image_dims(x, "operator input")?;
    let (_, _, kh, kw) = filter.dims4()?;
    let (ah, aw) = anchor;
    let padded = pad_circular(x, ah, kh - 1 - ah, aw, kw - 1 - aw)?;
    let weight = filter
        .broadcast_as((channels, 1, kh, kw))?
        .contiguous()?;
    Ok(padded.conv2d(&weight, 0, stride, 1, channels)?)
}

/// Blur with a fixed kernel under circular boundary conditions.
#[derive(Debug)]
pub struct Blur {
    kernel: Kernel,
    filter: Tensor,
    flipped: Tensor,
}

impl Blur {
    /// Upload `kernel` to `device`.
    pub fn new(kernel: Kernel, device: &Device) -> Result<Self> {
        let filter = kernel.to_tensor(device)?;
        let flipped = kernel.flipped().to_tensor(device)?;
        Ok(Self {
            kernel,
            filter,
            flipped,
        })
    }

    /// The blur kernel.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// `A x`: same spatial size as `x`.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        correlate_circular(x, &self.filter, self.kernel.anchor(), 1)
    }

    /// `A^T y`: correlation with the flipped kernel.
    pub fn adjoint(&self, y: &Tensor) -> Result<Tensor> {
        let (ah, aw) = self.kernel.anchor();
        let anchor = (self.kernel.height() - 1 - ah, self.kernel.width() - 1 - aw);
        correlate_circular(y, &self.flipped, anchor, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_delta_kernel_is_identity() {
        let blur = Blur::new(Kernel::new(vec![1.0], 1, 1).unwrap(), &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 3, 5, 5), &Device::Cpu).unwrap();
        let y = blur.apply(&x).unwrap();
        let diff = (y - &x).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_shift_kernel_wraps_around() {
        // taps [1, 0, 0] anchored at 1: out[i] = x[i - 1]
        let kernel = Kernel::new(vec![1.0, 0.0, 0.0], 1, 3).unwrap();
        let blur = Blur::new(kernel, &Device::Cpu).unwrap();
        let x = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0], (1, 1, 1, 4), &Device::Cpu).unwrap();
        let y = blur.apply(&x).unwrap().flatten_all().unwrap();
        assert_eq!(y.to_vec1::<f32>().unwrap(), vec![4.0, 1.0, 2.0, 3.0]);
        let back = blur.adjoint(&blur.apply(&x).unwrap()).unwrap();
        assert_eq!(
            back.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn test_preserves_constant_images() {
        let blur = Blur::new(Kernel::gaussian(1.0).unwrap(), &Device::Cpu).unwrap();
        let x = Tensor::ones((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let y = blur.apply(&x).unwrap();
        let diff = (y - &x).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }
}
