//! Random transform groups for equivariant imaging.
//!
//! Every transform is a linear map on the image built from differentiable
//! candle ops, so gradients flow back to the estimate when the reference
//! branch is not detached.

use candle_core::Tensor;

use crate::config::TransformKind;
use crate::error::Result;
use crate::physics::kernels::cubic;
use crate::physics::noise::NoiseSource;
use crate::physics::padding::{flip, image_dims, roll};

/// Rescaling factors drawn by [`Transform::Scale`].
pub const SCALE_FACTORS: [f64; 2] = [0.75, 0.5];

/// A random transform, drawn afresh on every application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    /// Rotation by a multiple of 90 degrees (180 only for non-square images).
    Rotate,
    /// Circular translation by a random offset.
    Shift,
    /// Bicubic rescaling about a random centre with circular boundary.
    Scale {
        /// Widen the interpolation kernel when shrinking.
        antialias: bool,
    },
    /// No-op.
    Identity,
}

impl Transform {
    /// Build from the configured kind.
    pub fn from_kind(kind: TransformKind, antialias: bool) -> Self {
        match kind {
            TransformKind::Rotate => Self::Rotate,
            TransformKind::Shift => Self::Shift,
            TransformKind::Scale => Self::Scale { antialias },
            TransformKind::Identity => Self::Identity,
        }
    }

    /// Apply a fresh random draw of the transform to `x`.
    pub fn apply(&self, x: &Tensor, source: &NoiseSource) -> Result<Tensor> {
        let (_, _, h, w) = image_dims(x, "transform input")?;
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Rotate => {
                let quarter_turns = if h == w {
                    source.choose(&[1usize, 2, 3])?
                } else {
                    2
                };
                rotate_quarter(x, quarter_turns)
            }
            Self::Shift => {
                let dy = source.index(h)?;
                let dx = source.index(w)?;
                roll(&roll(x, dy, 2)?, dx, 3)
            }
            Self::Scale { antialias } => {
                let factor = source.choose(&SCALE_FACTORS)?;
                let cy = source.index(h)? as f64;
                let cx = source.index(w)? as f64;
                rescale(x, factor, (cy, cx), *antialias)
            }
        }
    }
}

/// Rotate counter-clockwise by `quarter_turns * 90` degrees.
pub fn rotate_quarter(x: &Tensor, quarter_turns: usize) -> Result<Tensor> {
    match quarter_turns % 4 {
        0 => Ok(x.clone()),
        1 => flip(&x.transpose(2, 3)?.contiguous()?, 2),
        2 => flip(&flip(x, 2)?, 3),
        _ => flip(&x.transpose(2, 3)?.contiguous()?, 3),
    }
}

/// Rescale the spatial content by `factor` about `centre` (row, col).
///
/// Separable: `out = M_h x M_w^T` with one interpolation matrix per axis.
pub fn rescale(x: &Tensor, factor: f64, centre: (f64, f64), antialias: bool) -> Result<Tensor> {
    let (_, _, h, w) = image_dims(x, "rescale input")?;
    let device = x.device();
    let rows = Tensor::from_vec(interpolation_matrix(h, factor, centre.0, antialias), (h, h), device)?
        .to_dtype(x.dtype())?;
    let cols = Tensor::from_vec(interpolation_matrix(w, factor, centre.1, antialias), (w, w), device)?
        .to_dtype(x.dtype())?;
    let out = rows.broadcast_matmul(&x.contiguous()?)?;
    Ok(out.broadcast_matmul(&cols.t()?.contiguous()?)?)
}

/// Row-normalised bicubic resampling matrix of size `n x n`.
///
/// Output sample `i` reads the input at `centre + (i - centre) / factor`,
/// wrapping indices around the boundary.
pub(crate) fn interpolation_matrix(n: usize, factor: f64, centre: f64, antialias: bool) -> Vec<f32> {
    let support_scale = if antialias && factor < 1.0 { factor } else { 1.0 };
    let radius = 2.0 / support_scale;
    let mut matrix = vec![0f32; n * n];
    let mut row = vec![0f64; n];
    for i in 0..n {
        row.iter_mut().for_each(|v| *v = 0.0);
        let source = centre + (i as f64 - centre) / factor;
        let lo = (source - radius).floor() as i64;
        let hi = (source + radius).ceil() as i64;
        let mut total = 0.0;
        for j in lo..=hi {
            let weight = cubic((source - j as f64) * support_scale);
            if weight == 0.0 {
                continue;
            }
            row[j.rem_euclid(n as i64) as usize] += weight;
            total += weight;
        }
        if total.abs() < f64::EPSILON {
            continue;
        }
        for (col, v) in row.iter().enumerate() {
            matrix[i * n + col] = (v / total) as f32;
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn ramp(h: usize, w: usize) -> Tensor {
        let data: Vec<f32> = (0..h * w).map(|v| v as f32).collect();
        Tensor::from_vec(data, (1, 1, h, w), &Device::Cpu).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_quarter_rotation() {
        // [[0, 1], [2, 3]] rotated counter-clockwise is [[1, 3], [0, 2]]
        let x = ramp(2, 2);
        assert_eq!(values(&rotate_quarter(&x, 1).unwrap()), vec![1.0, 3.0, 0.0, 2.0]);
        assert_eq!(values(&rotate_quarter(&x, 2).unwrap()), vec![3.0, 2.0, 1.0, 0.0]);
        assert_eq!(values(&rotate_quarter(&x, 3).unwrap()), vec![2.0, 0.0, 3.0, 1.0]);
        assert_eq!(values(&rotate_quarter(&x, 4).unwrap()), values(&x));
    }

    #[test]
    fn test_rotate_keeps_non_square_shape() {
        let source = NoiseSource::new(3);
        let x = ramp(4, 6);
        for _ in 0..5 {
            let y = Transform::Rotate.apply(&x, &source).unwrap();
            assert_eq!(y.dims(), &[1, 1, 4, 6]);
        }
    }

    #[test]
    fn test_shift_permutes_pixels() {
        let source = NoiseSource::new(11);
        let x = ramp(5, 7);
        let y = Transform::Shift.apply(&x, &source).unwrap();
        let mut a = values(&x);
        let mut b = values(&y);
        a.sort_by(f32::total_cmp);
        b.sort_by(f32::total_cmp);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unit_factor_is_identity() {
        let m = interpolation_matrix(6, 1.0, 2.0, true);
        for i in 0..6 {
            for j in 0..6 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((m[i * 6 + j] - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_scale_preserves_constants() {
        let source = NoiseSource::new(5);
        let x = Tensor::ones((2, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        for antialias in [false, true] {
            let y = Transform::Scale { antialias }.apply(&x, &source).unwrap();
            assert_eq!(y.dims(), x.dims());
            for v in values(&y) {
                assert!((v - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_scale_is_differentiable() {
        let var = candle_core::Var::from_tensor(&ramp(6, 6)).unwrap();
        let y = rescale(var.as_tensor(), 0.5, (3.0, 3.0), false).unwrap();
        let grads = y.sum_all().unwrap().backward().unwrap();
        assert!(grads.get(var.as_tensor()).is_some());
    }
}
