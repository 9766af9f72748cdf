//! Output unit: answer classifier over the final memory and the question.
//!
//! ```text
//! x      = [memory ‖ W_q q + b_q]                      (N, 2D)
//! layer  = [BatchNorm] → Dropout → Linear → ReLU        (hidden layers)
//! logits = [BatchNorm] → Dropout → Linear               (last layer)
//! ```

use candle_core::Tensor;
use candle_nn::{batch_norm, linear, BatchNorm, Dropout, Linear, Module, ModuleT, VarBuilder};
use tmac_core::{ClassifierConfig, TmacError};

/// Feed-forward classifier producing raw answer logits.
#[derive(Debug, Clone)]
pub struct OutputUnit {
    question_transformer: Linear,
    linears: Vec<Linear>,
    batchnorms: Vec<Option<BatchNorm>>,
    dropout: Dropout,
    num_answers: usize,
}

impl OutputUnit {
    /// Builds `2D → hidden… → num_answers`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Internal`] if parameter creation fails.
    pub fn new(
        module_dim: usize,
        config: &ClassifierConfig,
        num_answers: usize,
        vb: VarBuilder,
    ) -> Result<Self, TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("OutputUnit new: {e}"),
        };

        let question_transformer =
            linear(module_dim, module_dim, vb.pp("question_transformer")).map_err(map_err)?;

        let mut widths = vec![2 * module_dim];
        widths.extend(&config.fc_layers);
        widths.push(num_answers);

        let mut linears = Vec::with_capacity(widths.len() - 1);
        let mut batchnorms = Vec::with_capacity(widths.len() - 1);
        for (i, pair) in widths.windows(2).enumerate() {
            let (nin, nout) = (pair[0], pair[1]);
            linears.push(linear(nin, nout, vb.pp(format!("fc_{i}"))).map_err(map_err)?);
            batchnorms.push(if config.batchnorm {
                Some(batch_norm(nin, 1e-5, vb.pp(format!("bn_{i}"))).map_err(map_err)?)
            } else {
                None
            });
        }

        Ok(Self {
            question_transformer,
            linears,
            batchnorms,
            dropout: Dropout::new(config.dropout),
            num_answers,
        })
    }

    /// Number of answer classes.
    pub fn num_answers(&self) -> usize {
        self.num_answers
    }

    /// Number of linear layers in the stack (hidden layers + output).
    pub fn depth(&self) -> usize {
        self.linears.len()
    }

    /// Computes `(N, num_answers)` logits from `final_memory` and the
    /// original pooled question, both `(N, D)`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Internal`] on a shape error.
    pub fn forward(
        &self,
        final_memory: &Tensor,
        question: &Tensor,
        train: bool,
    ) -> Result<Tensor, TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("OutputUnit forward: {e}"),
        };

        let transformed_question = self.question_transformer.forward(question).map_err(map_err)?;
        let mut features =
            Tensor::cat(&[final_memory, &transformed_question], 1).map_err(map_err)?;

        let last = self.linears.len() - 1;
        for (i, (layer, bn)) in self.linears.iter().zip(&self.batchnorms).enumerate() {
            if let Some(bn) = bn {
                features = bn.forward_t(&features, train).map_err(map_err)?;
            }
            features = self.dropout.forward(&features, train).map_err(map_err)?;
            features = layer.forward(&features).map_err(map_err)?;
            if i < last {
                features = features.relu().map_err(map_err)?;
            }
        }
        Ok(features)
    }
}
