//! Input unit: a step-specific linear view of the question vector.

use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};
use tmac_core::TmacError;

/// Projects the shared question vector `(N, D) → (N, D)` for one step
/// (or one group of steps sharing parameters).
#[derive(Debug, Clone)]
pub struct InputUnit {
    question_transformer: Linear,
}

impl InputUnit {
    /// Creates the unit under `vb`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Internal`] if parameter creation fails.
    pub fn new(module_dim: usize, vb: VarBuilder) -> Result<Self, TmacError> {
        let question_transformer = linear(module_dim, module_dim, vb.pp("question_transformer"))
            .map_err(|e| TmacError::Internal {
                message: format!("InputUnit new: {e}"),
            })?;
        Ok(Self {
            question_transformer,
        })
    }

    /// # Errors
    ///
    /// Returns [`TmacError::Internal`] if `question` is not `(N, D)`.
    pub fn forward(&self, question: &Tensor) -> Result<Tensor, TmacError> {
        self.question_transformer
            .forward(question)
            .map_err(|e| TmacError::Internal {
                message: format!("InputUnit forward: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn zero_bias_projection_of_zero_is_zero() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let unit = InputUnit::new(4, vb).unwrap();
        crate::init::initialize_parameters(&var_map, "", &Default::default()).unwrap();

        let q = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let out = unit.forward(&q).unwrap();
        assert_eq!(out.dims(), &[3, 4]);
        let flat = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(flat.iter().all(|v| *v == 0.0));
    }
}
