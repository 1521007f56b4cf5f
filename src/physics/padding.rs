//! Differentiable index helpers on `(batch, channels, height, width)` tensors.
//!
//! Everything here is built from `narrow`, `cat` and `index_select`, so
//! gradients flow back through the padding and permutations.

use candle_core::Tensor;

use crate::error::{RestoreError, Result};

/// Dimensions of a rank-4 image batch, or a shape error naming `what`.
pub fn image_dims(t: &Tensor, what: &str) -> Result<(usize, usize, usize, usize)> {
    match t.dims() {
        &[b, c, h, w] => Ok((b, c, h, w)),
        dims => Err(RestoreError::shape(
            format!("{what} of shape (batch, channels, height, width)"),
            format!("{dims:?}"),
        )),
    }
}

fn wrap_dim(x: &Tensor, dim: usize, before: usize, after: usize) -> Result<Tensor> {
    let n = x.dim(dim)?;
    if before > n || after > n {
        return Err(RestoreError::shape(
            format!("circular padding of at most {n} along dim {dim}"),
            format!("({before}, {after})"),
        ));
    }
    let mut parts = Vec::with_capacity(3);
    if before > 0 {
        parts.push(x.narrow(dim, n - before, before)?);
    }
    parts.push(x.clone());
    if after > 0 {
        parts.push(x.narrow(dim, 0, after)?);
    }
    if parts.len() == 1 {
        return Ok(x.clone());
    }
    Ok(Tensor::cat(&parts, dim)?)
}

/// Circularly pad the two spatial dimensions.
pub fn pad_circular(
    x: &Tensor,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
) -> Result<Tensor> {
    image_dims(x, "padded input")?;
    let x = wrap_dim(x, 2, top, bottom)?;
    wrap_dim(&x, 3, left, right)
}

/// Circular shift by `shift` positions along `dim`: `out[i] = x[i - shift]`.
pub fn roll(x: &Tensor, shift: usize, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)?;
    let shift = if n == 0 { 0 } else { shift % n };
    if shift == 0 {
        return Ok(x.clone());
    }
    let head = x.narrow(dim, n - shift, shift)?;
    let tail = x.narrow(dim, 0, n - shift)?;
    Ok(Tensor::cat(&[head, tail], dim)?)
}

/// Reverse the order of elements along `dim`.
pub fn flip(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)?;
    let index: Vec<u32> = (0..n as u32).rev().collect();
    let index = Tensor::from_vec(index, n, x.device())?;
    Ok(x.index_select(&index, dim)?)
}
