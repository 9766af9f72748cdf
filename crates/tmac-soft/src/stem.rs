//! Convolutional stem: image features → `module_dim` feature map.
//!
//! Architecture per layer:
//!
//! ```text
//! Conv2d(prev → D, k, stride, pad) → [BatchNorm2d] → ReLU → [MaxPool 2×2]
//! ```

use candle_core::Tensor;
use candle_nn::{batch_norm, conv2d, BatchNorm, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder};
use tmac_core::{StemConfig, TmacError};

/// Stack of conv layers turning `(N, C, H, W)` into `(N, D, H', W')`.
#[derive(Debug)]
pub struct Stem {
    layers: Vec<StemLayer>,
    in_channels: usize,
    out_channels: usize,
}

#[derive(Debug)]
struct StemLayer {
    conv: Conv2d,
    batchnorm: Option<BatchNorm>,
    subsample: bool,
}

impl Stem {
    /// Builds the stem. With zero layers the stem is the identity.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Internal`] if parameter creation fails.
    pub fn new(
        in_channels: usize,
        module_dim: usize,
        config: &StemConfig,
        vb: VarBuilder,
    ) -> Result<Self, TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("Stem new: {e}"),
        };

        let mut layers = Vec::with_capacity(config.num_layers);
        let mut prev = in_channels;
        for i in 0..config.num_layers {
            let conv_config = Conv2dConfig {
                padding: config.padding_at(i),
                stride: config.stride_at(i),
                ..Default::default()
            };
            let conv = conv2d(
                prev,
                module_dim,
                config.kernel_size_at(i),
                conv_config,
                vb.pp(format!("conv_{i}")),
            )
            .map_err(map_err)?;
            let batchnorm = if config.batchnorm {
                Some(batch_norm(module_dim, 1e-5, vb.pp(format!("bn_{i}"))).map_err(map_err)?)
            } else {
                None
            };
            layers.push(StemLayer {
                conv,
                batchnorm,
                subsample: config.subsamples(i),
            });
            prev = module_dim;
        }

        Ok(Self {
            layers,
            in_channels,
            out_channels: prev,
        })
    }

    /// Number of conv layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Channels of the produced feature map.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Runs the stem; batch norm uses batch statistics when `train`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::ShapeMismatch`] if the channel count is wrong.
    pub fn forward(&self, images: &Tensor, train: bool) -> Result<Tensor, TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("Stem forward: {e}"),
        };

        let (_, channels, _, _) = images.dims4().map_err(|e| TmacError::ShapeMismatch {
            message: format!("stem input must be (N, C, H, W): {e}"),
        })?;
        if channels != self.in_channels {
            return Err(TmacError::ShapeMismatch {
                message: format!(
                    "stem expects {} input channels, got {channels}",
                    self.in_channels
                ),
            });
        }

        let mut x = images.clone();
        for layer in &self.layers {
            x = layer.conv.forward(&x).map_err(map_err)?;
            if let Some(bn) = &layer.batchnorm {
                x = bn.forward_t(&x, train).map_err(map_err)?;
            }
            x = x.relu().map_err(map_err)?;
            if layer.subsample {
                x = x.max_pool2d(2).map_err(map_err)?;
            }
        }
        Ok(x)
    }
}
