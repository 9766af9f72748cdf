//! Coordinate channels appended to the image before the stem.

use candle_core::{Device, Tensor};
use tmac_core::TmacError;

/// `n` evenly spaced values from `start` to `end` inclusive.
fn linspace(start: f32, end: f32, n: usize) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f32;
            (0..n).map(|i| start + step * i as f32).collect()
        }
    }
}

/// Two `(H, W)` maps stacked into `(2, H, W)`: x in `[-1, 1]` along the
/// width, then y in `[-1, 1]` along the height.
///
/// # Errors
///
/// Returns [`TmacError::Internal`] if the tensor cannot be allocated.
///
/// # Example
///
/// ```
/// use candle_core::Device;
/// use tmac_soft::coords::coord_map;
///
/// let map = coord_map(2, 3, &Device::Cpu).unwrap();
/// assert_eq!(map.dims(), &[2, 2, 3]);
/// let x = map.get(0).unwrap().to_vec2::<f32>().unwrap();
/// assert_eq!(x[1], vec![-1.0, 0.0, 1.0]);
/// ```
pub fn coord_map(height: usize, width: usize, device: &Device) -> Result<Tensor, TmacError> {
    let xs = linspace(-1.0, 1.0, width);
    let ys = linspace(-1.0, 1.0, height);

    let mut data = Vec::with_capacity(2 * height * width);
    for _ in 0..height {
        data.extend_from_slice(&xs);
    }
    for &y in &ys {
        data.extend(std::iter::repeat(y).take(width));
    }

    Tensor::from_vec(data, (2, height, width), device).map_err(|e| TmacError::Internal {
        message: format!("coord_map: {e}"),
    })
}

/// Sinusoidal alternative to [`coord_map`], `(2, H, W)`.
///
/// Cell `(i, j)` gets `sin(i / 10000^(j' / p_h))` in channel 0 and
/// `cos(j / 10000^(i' / p_w))` in channel 1, where `i'`/`j'` round the
/// index down to the nearest even number.
///
/// # Errors
///
/// Returns [`TmacError::Internal`] if the tensor cannot be allocated.
pub fn sincos_coord_map(
    height: usize,
    width: usize,
    p_h: f32,
    p_w: f32,
    device: &Device,
) -> Result<Tensor, TmacError> {
    let even = |k: usize| k - k % 2;
    let mut xs = Vec::with_capacity(height * width);
    let mut ys = Vec::with_capacity(height * width);
    for i in 0..height {
        for j in 0..width {
            xs.push((i as f32 / 10000f32.powf(even(j) as f32 / p_h)).sin());
            ys.push((j as f32 / 10000f32.powf(even(i) as f32 / p_w)).cos());
        }
    }
    xs.extend(ys);

    Tensor::from_vec(xs, (2, height, width), device).map_err(|e| TmacError::Internal {
        message: format!("sincos_coord_map: {e}"),
    })
}

/// Appends [`coord_map`] channels to an `(N, C, H, W)` batch.
///
/// # Errors
///
/// Returns [`TmacError::ShapeMismatch`] if `images` is not rank 4.
pub fn append_coords(images: &Tensor) -> Result<Tensor, TmacError> {
    let map_err = |e: candle_core::Error| TmacError::Internal {
        message: format!("append_coords: {e}"),
    };

    let (n, _, h, w) = images.dims4().map_err(|e| TmacError::ShapeMismatch {
        message: format!("image batch must be (N, C, H, W): {e}"),
    })?;
    let coords = coord_map(h, w, images.device())?
        .to_dtype(images.dtype())
        .map_err(map_err)?
        .unsqueeze(0)
        .map_err(map_err)?
        .broadcast_as((n, 2, h, w))
        .map_err(map_err)?
        .contiguous()
        .map_err(map_err)?;
    Tensor::cat(&[images, &coords], 1).map_err(map_err)
}
