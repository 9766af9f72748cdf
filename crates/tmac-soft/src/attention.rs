//! Masked softmax attention, shared by the control and read units.
//!
//! Both units score a set of positions (question tokens or image cells),
//! normalise the scores with [`masked_softmax`] along the last axis, and
//! pool the value vectors with [`weighted_sum`].
//!
//! The softmax subtracts the row maximum before exponentiating, then
//! multiplies by the mask so padding contributes nothing to the
//! normaliser. A row with every position masked divides zero by zero and
//! yields NaN; callers guarantee at least one valid position.

use candle_core::{Tensor, D};
use tmac_core::TmacError;

/// Softmax over the last axis of `scores`, optionally masked.
///
/// `mask` is multiplicative (1 = valid, 0 = padding) and must broadcast to
/// the shape of `scores`.
///
/// # Errors
///
/// Returns [`TmacError::Internal`] if the mask does not broadcast.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use tmac_soft::attention::masked_softmax;
///
/// let scores = Tensor::new(&[[1.0f32, 2.0, 3.0]], &Device::Cpu).unwrap();
/// let mask = Tensor::new(&[[1.0f32, 1.0, 0.0]], &Device::Cpu).unwrap();
/// let weights = masked_softmax(&scores, Some(&mask)).unwrap();
/// let row = weights.squeeze(0).unwrap().to_vec1::<f32>().unwrap();
/// assert_eq!(row[2], 0.0);
/// assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
/// ```
pub fn masked_softmax(scores: &Tensor, mask: Option<&Tensor>) -> Result<Tensor, TmacError> {
    let map_err = |e: candle_core::Error| TmacError::Internal {
        message: format!("masked_softmax: {e}"),
    };

    let max = scores.max_keepdim(D::Minus1).map_err(map_err)?;
    let mut exp = scores.broadcast_sub(&max).map_err(map_err)?.exp().map_err(map_err)?;
    if let Some(mask) = mask {
        exp = exp.broadcast_mul(mask).map_err(map_err)?;
    }
    let total = exp.sum_keepdim(D::Minus1).map_err(map_err)?;
    exp.broadcast_div(&total).map_err(map_err)
}

/// Pools `values` `(N, L, D)` with attention `weights` `(N, L)` into `(N, D)`.
///
/// # Errors
///
/// Returns [`TmacError::Internal`] if the shapes disagree.
pub fn weighted_sum(values: &Tensor, weights: &Tensor) -> Result<Tensor, TmacError> {
    let map_err = |e: candle_core::Error| TmacError::Internal {
        message: format!("weighted_sum: {e}"),
    };

    values
        .broadcast_mul(&weights.unsqueeze(2).map_err(map_err)?)
        .map_err(map_err)?
        .sum(1)
        .map_err(map_err)
}
