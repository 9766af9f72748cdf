//! Control unit: decides which part of the question a step attends to.
//!
//! ```text
//! q'      = W_c [c_1 ‖ … ‖ c_K ‖ q] + b_c        (only with prior control)
//! s_l     = w_s · (ctx_l ⊙ q') + b_s
//! α       = masked_softmax(s, mask)
//! control = Σ_l α_l ctx_l
//! ```
//!
//! `K` is the step's child count, or 1 for a leaf fed the sentinel.

use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};
use tmac_core::topology::effective_arity;
use tmac_core::TmacError;

use crate::attention::{masked_softmax, weighted_sum};

/// Attention over the question context sequence.
#[derive(Debug, Clone)]
pub struct ControlUnit {
    num_parents: usize,
    module_dim: usize,
    control_question_transformer: Option<Linear>,
    score_transformer: Linear,
}

impl ControlUnit {
    /// Creates a control unit for steps with `num_children` children.
    ///
    /// The prior-control fusion layer, `(K+1)·D → D`, only exists when
    /// `use_prior_control` is set.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Internal`] if parameter creation fails.
    pub fn new(
        num_children: usize,
        module_dim: usize,
        use_prior_control: bool,
        vb: VarBuilder,
    ) -> Result<Self, TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("ControlUnit new: {e}"),
        };

        let num_parents = effective_arity(num_children);
        let control_question_transformer = if use_prior_control {
            Some(
                linear(
                    (num_parents + 1) * module_dim,
                    module_dim,
                    vb.pp("control_question_transformer"),
                )
                .map_err(map_err)?,
            )
        } else {
            None
        };
        let score_transformer = linear(module_dim, 1, vb.pp("score_transformer")).map_err(map_err)?;

        Ok(Self {
            num_parents,
            module_dim,
            control_question_transformer,
            score_transformer,
        })
    }

    /// Number of parent controls this unit accepts.
    pub fn num_parents(&self) -> usize {
        self.num_parents
    }

    /// Nominal fused input width, `(K+1)·D`.
    pub fn input_width(&self) -> usize {
        (self.num_parents + 1) * self.module_dim
    }

    /// `(out, in)` of the fusion layer, if prior controls are used.
    pub fn fusion_shape(&self) -> Option<(usize, usize)> {
        self.control_question_transformer
            .as_ref()
            .and_then(|l| l.weight().dims2().ok())
    }

    /// Computes the new control vector.
    ///
    /// Shapes: `pre_controls` K × `(N, D)`, `question` `(N, D)`,
    /// `context` `(N, L, D)`, `mask` `(N, L)`. Returns `(N, D)`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::ChildCountMismatch`] if `pre_controls.len()`
    /// differs from the unit's arity, or [`TmacError::Internal`] on a
    /// shape error.
    pub fn forward(
        &self,
        pre_controls: &[Tensor],
        question: &Tensor,
        context: &Tensor,
        mask: &Tensor,
    ) -> Result<Tensor, TmacError> {
        self.attend(pre_controls, question, context, mask)
            .map(|(control, _)| control)
    }

    /// Like [`forward`](Self::forward), also returning the `(N, L)`
    /// attention weights over the context.
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward).
    pub fn attend(
        &self,
        pre_controls: &[Tensor],
        question: &Tensor,
        context: &Tensor,
        mask: &Tensor,
    ) -> Result<(Tensor, Tensor), TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("ControlUnit forward: {e}"),
        };

        if pre_controls.len() != self.num_parents {
            return Err(TmacError::ChildCountMismatch {
                unit: "ControlUnit".to_string(),
                expected: self.num_parents,
                got: pre_controls.len(),
            });
        }

        let control_question = match &self.control_question_transformer {
            Some(fuse) => {
                let mut parts: Vec<&Tensor> = pre_controls.iter().collect();
                parts.push(question);
                let joined = Tensor::cat(&parts, 1).map_err(map_err)?;
                fuse.forward(&joined).map_err(map_err)?
            }
            None => question.clone(),
        };

        let interactions = context
            .broadcast_mul(&control_question.unsqueeze(1).map_err(map_err)?)
            .map_err(map_err)?;
        let scores = self
            .score_transformer
            .forward(&interactions)
            .map_err(map_err)?
            .squeeze(2)
            .map_err(map_err)?;

        let weights = masked_softmax(&scores, Some(mask))?;
        let control = weighted_sum(context, &weights)?;
        Ok((control, weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use crate::test_util::{assert_rows_close, linear_ref, perturb_biases, softmax_ref};

    const D: usize = 4;

    fn unit(num_children: usize, use_prior: bool) -> ControlUnit {
        unit_with_vars(num_children, use_prior).0
    }

    fn unit_with_vars(num_children: usize, use_prior: bool) -> (ControlUnit, VarMap) {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let unit = ControlUnit::new(num_children, D, use_prior, vb).unwrap();
        crate::init::initialize_parameters(&var_map, "", &Default::default()).unwrap();
        (unit, var_map)
    }

    fn context() -> Tensor {
        let data: Vec<f32> = (0..2 * 3 * D).map(|i| (i as f32 * 0.37).sin()).collect();
        Tensor::from_vec(data, (2, 3, D), &Device::Cpu).unwrap()
    }

    fn vector(value: f32) -> Tensor {
        Tensor::full(value, (2, D), &Device::Cpu).unwrap()
    }

    #[test]
    fn leaf_unit_takes_one_parent() {
        let unit = unit(0, true);
        assert_eq!(unit.num_parents(), 1);
        assert_eq!(unit.input_width(), 2 * D);
        assert_eq!(unit.fusion_shape(), Some((D, 2 * D)));
    }

    #[test]
    fn no_fusion_layer_without_prior_control() {
        let unit = unit(2, false);
        assert_eq!(unit.fusion_shape(), None);
        assert_eq!(unit.input_width(), 3 * D);
    }

    #[test]
    fn wrong_parent_count_rejected() {
        let unit = unit(2, true);
        let mask = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let err = unit
            .forward(&[vector(0.1)], &vector(0.2), &context(), &mask)
            .unwrap_err();
        assert_eq!(
            err,
            TmacError::ChildCountMismatch {
                unit: "ControlUnit".to_string(),
                expected: 2,
                got: 1,
            }
        );
    }

    #[test]
    fn attention_respects_mask() {
        let unit = unit(2, true);
        let mask = Tensor::new(&[[1.0f32, 1.0, 0.0], [1.0, 0.0, 0.0]], &Device::Cpu).unwrap();
        let (control, weights) = unit
            .attend(&[vector(0.1), vector(-0.3)], &vector(0.2), &context(), &mask)
            .unwrap();
        assert_eq!(control.dims(), &[2, D]);

        let weights = weights.to_vec2::<f32>().unwrap();
        assert_eq!(weights[0][2], 0.0);
        assert!((weights[0].iter().sum::<f32>() - 1.0).abs() < 1e-5);
        // One valid token: the control is exactly that token.
        assert!((weights[1][0] - 1.0).abs() < 1e-6);
        let first_token = context().get(1).unwrap().get(0).unwrap().to_vec1::<f32>().unwrap();
        let control_1 = control.get(1).unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in first_token.iter().zip(&control_1) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn control_is_convex_combination_of_context() {
        let unit = unit(0, false);
        let mask = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let control = unit
            .forward(&[vector(0.0)], &vector(0.5), &context(), &mask)
            .unwrap();
        let ctx = context().to_vec3::<f32>().unwrap();
        let control = control.to_vec2::<f32>().unwrap();
        for n in 0..2 {
            for d in 0..D {
                let lo = (0..3).map(|l| ctx[n][l][d]).fold(f32::INFINITY, f32::min);
                let hi = (0..3).map(|l| ctx[n][l][d]).fold(f32::NEG_INFINITY, f32::max);
                assert!(control[n][d] >= lo - 1e-6 && control[n][d] <= hi + 1e-6);
            }
        }
    }

    fn rows(seed: f32) -> Vec<Vec<f32>> {
        (0..2)
            .map(|n| (0..D).map(|d| ((n * D + d) as f32 * 0.53 + seed).sin()).collect())
            .collect()
    }

    fn tensor(rows: &[Vec<f32>]) -> Tensor {
        Tensor::from_vec(rows.concat(), (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
    }

    /// Control vectors computed with plain loops from the stored weights.
    fn reference(
        var_map: &VarMap,
        use_prior: bool,
        pre_controls: &[Vec<Vec<f32>>],
        question: &[Vec<f32>],
        mask: &[Vec<f32>],
    ) -> Vec<Vec<f32>> {
        let ctx = context().to_vec3::<f32>().unwrap();
        (0..2)
            .map(|n| {
                let query = if use_prior {
                    let mut joined = Vec::new();
                    for parent in pre_controls {
                        joined.extend_from_slice(&parent[n]);
                    }
                    joined.extend_from_slice(&question[n]);
                    linear_ref(var_map, "control_question_transformer", &joined)
                } else {
                    question[n].clone()
                };
                let scores: Vec<f32> = ctx[n]
                    .iter()
                    .map(|token| {
                        let interaction: Vec<f32> =
                            token.iter().zip(&query).map(|(t, q)| t * q).collect();
                        linear_ref(var_map, "score_transformer", &interaction)[0]
                    })
                    .collect();
                let weights = softmax_ref(&scores, &mask[n]);
                (0..D)
                    .map(|d| (0..3).map(|l| weights[l] * ctx[n][l][d]).sum::<f32>())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn matches_reference_with_prior_control() {
        let (unit, var_map) = unit_with_vars(2, true);
        perturb_biases(&var_map);
        let parents = vec![rows(0.1), rows(1.7)];
        let question = rows(2.9);
        let mask = vec![vec![1.0, 1.0, 1.0], vec![1.0, 0.0, 1.0]];

        let control = unit
            .forward(
                &[tensor(&parents[0]), tensor(&parents[1])],
                &tensor(&question),
                &context(),
                &tensor(&mask),
            )
            .unwrap();
        let expected = reference(&var_map, true, &parents, &question, &mask);
        assert_rows_close(&control, &expected, 1e-5);

        // Parent order matters to the fused query.
        let swapped = unit
            .forward(
                &[tensor(&parents[1]), tensor(&parents[0])],
                &tensor(&question),
                &context(),
                &tensor(&mask),
            )
            .unwrap();
        let swapped_expected =
            reference(&var_map, true, &[parents[1].clone(), parents[0].clone()], &question, &mask);
        assert_rows_close(&swapped, &swapped_expected, 1e-5);
    }

    #[test]
    fn matches_reference_without_prior_control() {
        let (unit, var_map) = unit_with_vars(2, false);
        perturb_biases(&var_map);
        let parents = vec![rows(0.4), rows(-1.2)];
        let question = rows(0.8);
        let mask = vec![vec![1.0, 1.0, 0.0], vec![1.0, 1.0, 1.0]];

        let control = unit
            .forward(
                &[tensor(&parents[0]), tensor(&parents[1])],
                &tensor(&question),
                &context(),
                &tensor(&mask),
            )
            .unwrap();
        let expected = reference(&var_map, false, &parents, &question, &mask);
        assert_rows_close(&control, &expected, 1e-5);
    }
}
