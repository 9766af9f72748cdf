//! Read unit: retrieves image information guided by control and memory.
//!
//! ```text
//! I'      = W_i · drop(I)                                (N, H, W, D)
//! m'_k    = W_k · drop(m_k)          one layer per parent slot
//! x       = relu(W_x [m'_1 ⊙ I' ‖ … ‖ m'_K ⊙ I' ‖ I'])
//! s       = w_r · drop(relu(c ⊙ x))                      (N, H, W)
//! α       = softmax over H·W
//! read    = Σ_hw α_hw I_hw                               (original features)
//! ```

use candle_core::Tensor;
use candle_nn::{linear, Dropout, Linear, Module, VarBuilder};
use tmac_core::topology::effective_arity;
use tmac_core::TmacError;

use crate::attention::{masked_softmax, weighted_sum};

/// Attention over the spatial image features.
#[derive(Debug, Clone)]
pub struct ReadUnit {
    num_parents: usize,
    image_element_transformer: Linear,
    pre_memory_transformers: Vec<Linear>,
    intermediate_transformer: Linear,
    read_attention_transformer: Linear,
    dropout: Dropout,
}

impl ReadUnit {
    /// Creates a read unit for steps with `num_children` children.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Internal`] if parameter creation fails.
    pub fn new(
        num_children: usize,
        module_dim: usize,
        read_dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self, TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("ReadUnit new: {e}"),
        };

        let num_parents = effective_arity(num_children);
        let image_element_transformer =
            linear(module_dim, module_dim, vb.pp("image_element_transformer")).map_err(map_err)?;
        let pre_memory_transformers = (0..num_parents)
            .map(|k| linear(module_dim, module_dim, vb.pp(format!("pre_memory_transformer_{k}"))))
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        let intermediate_transformer = linear(
            (num_parents + 1) * module_dim,
            module_dim,
            vb.pp("intermediate_transformer"),
        )
        .map_err(map_err)?;
        let read_attention_transformer =
            linear(module_dim, 1, vb.pp("read_attention_transformer")).map_err(map_err)?;

        Ok(Self {
            num_parents,
            image_element_transformer,
            pre_memory_transformers,
            intermediate_transformer,
            read_attention_transformer,
            dropout: Dropout::new(read_dropout),
        })
    }

    /// Number of parent memories this unit accepts.
    pub fn num_parents(&self) -> usize {
        self.num_parents
    }

    /// Computes the read vector.
    ///
    /// Shapes: `pre_memories` K × `(N, D)`, `control` `(N, D)`,
    /// `image` `(N, D, H, W)`. Returns `(N, D)`. Dropout is active only
    /// when `train` is set.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::ChildCountMismatch`] if `pre_memories.len()`
    /// differs from the unit's arity.
    pub fn forward(
        &self,
        pre_memories: &[Tensor],
        control: &Tensor,
        image: &Tensor,
        train: bool,
    ) -> Result<Tensor, TmacError> {
        self.attend(pre_memories, control, image, train)
            .map(|(read, _)| read)
    }

    /// Like [`forward`](Self::forward), also returning the `(N, H·W)`
    /// attention weights.
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward).
    pub fn attend(
        &self,
        pre_memories: &[Tensor],
        control: &Tensor,
        image: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor), TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("ReadUnit forward: {e}"),
        };

        if pre_memories.len() != self.num_parents {
            return Err(TmacError::ChildCountMismatch {
                unit: "ReadUnit".to_string(),
                expected: self.num_parents,
                got: pre_memories.len(),
            });
        }

        // (N, D, H, W) -> (N, H, W, D)
        let image = image
            .permute((0, 2, 3, 1))
            .map_err(map_err)?
            .contiguous()
            .map_err(map_err)?;
        let (n, h, w, d) = image.dims4().map_err(map_err)?;

        let trans_image = self.dropout.forward(&image, train).map_err(map_err)?;
        let trans_image = self
            .image_element_transformer
            .forward(&trans_image)
            .map_err(map_err)?;

        let mut intermediates = Vec::with_capacity(self.num_parents + 1);
        for (memory, transformer) in pre_memories.iter().zip(&self.pre_memory_transformers) {
            let memory = self.dropout.forward(memory, train).map_err(map_err)?;
            let memory = transformer
                .forward(&memory)
                .map_err(map_err)?
                .reshape((n, 1, 1, d))
                .map_err(map_err)?;
            intermediates.push(trans_image.broadcast_mul(&memory).map_err(map_err)?);
        }
        intermediates.push(trans_image);

        let joined = Tensor::cat(&intermediates, 3).map_err(map_err)?;
        let intermediate = self
            .intermediate_transformer
            .forward(&joined)
            .map_err(map_err)?
            .relu()
            .map_err(map_err)?;

        let control = control.reshape((n, 1, 1, d)).map_err(map_err)?;
        let score_input = intermediate
            .broadcast_mul(&control)
            .map_err(map_err)?
            .relu()
            .map_err(map_err)?;
        let score_input = self.dropout.forward(&score_input, train).map_err(map_err)?;
        let scores = self
            .read_attention_transformer
            .forward(&score_input)
            .map_err(map_err)?
            .reshape((n, h * w))
            .map_err(map_err)?;

        let weights = masked_softmax(&scores, None)?;
        let cells = image.reshape((n, h * w, d)).map_err(map_err)?;
        let read = weighted_sum(&cells, &weights)?;
        Ok((read, weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use crate::test_util::{assert_rows_close, linear_ref, perturb_biases, softmax_ref};

    const D: usize = 4;

    fn unit(num_children: usize, var_map: &VarMap) -> ReadUnit {
        let vb = VarBuilder::from_varmap(var_map, DType::F32, &Device::Cpu);
        let unit = ReadUnit::new(num_children, D, 0.0, vb).unwrap();
        crate::init::initialize_parameters(var_map, "", &Default::default()).unwrap();
        unit
    }

    fn image() -> Tensor {
        let data: Vec<f32> = (0..D * 2 * 3).map(|i| (i as f32 * 0.21).cos()).collect();
        Tensor::from_vec(data, (1, D, 2, 3), &Device::Cpu).unwrap()
    }

    fn vector(value: f32) -> Tensor {
        Tensor::full(value, (1, D), &Device::Cpu).unwrap()
    }

    #[test]
    fn one_memory_transformer_per_parent_slot() {
        let var_map = VarMap::new();
        let unit = unit(3, &var_map);
        assert_eq!(unit.num_parents(), 3);
        let data = var_map.data().lock().unwrap();
        assert!(data.contains_key("pre_memory_transformer_2.weight"));
        assert!(!data.contains_key("pre_memory_transformer_3.weight"));
        assert_eq!(
            data["intermediate_transformer.weight"].dims(),
            &[D, 4 * D]
        );
    }

    #[test]
    fn wrong_parent_count_rejected() {
        let var_map = VarMap::new();
        let unit = unit(0, &var_map);
        let err = unit
            .forward(&[vector(0.1), vector(0.2)], &vector(1.0), &image(), false)
            .unwrap_err();
        assert!(matches!(
            err,
            TmacError::ChildCountMismatch { expected: 1, got: 2, .. }
        ));
    }

    #[test]
    fn weights_cover_every_cell_and_sum_to_one() {
        let var_map = VarMap::new();
        let unit = unit(2, &var_map);
        let (read, weights) = unit
            .attend(&[vector(0.3), vector(-0.2)], &vector(0.7), &image(), false)
            .unwrap();
        assert_eq!(read.dims(), &[1, D]);
        assert_eq!(weights.dims(), &[1, 6]);
        let weights = weights.to_vec2::<f32>().unwrap();
        assert!((weights[0].iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn read_pools_original_features() {
        // Identical cells: any attention distribution returns that cell.
        let var_map = VarMap::new();
        let unit = unit(0, &var_map);
        let cell = [0.5f32, -1.0, 2.0, 0.25];
        let mut data = Vec::new();
        for c in cell {
            data.extend([c; 4]);
        }
        let image = Tensor::from_vec(data, (1, D, 2, 2), &Device::Cpu).unwrap();
        let read = unit
            .forward(&[vector(0.4)], &vector(0.9), &image, false)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        for (a, b) in read[0].iter().zip(cell) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn eval_mode_is_deterministic() {
        let var_map = VarMap::new();
        let unit = ReadUnit::new(
            1,
            D,
            0.5,
            VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu),
        )
        .unwrap();
        let a = unit
            .forward(&[vector(0.1)], &vector(0.2), &image(), false)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let b = unit
            .forward(&[vector(0.1)], &vector(0.2), &image(), false)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(a, b);
    }

    fn batch_rows(seed: f32) -> Vec<Vec<f32>> {
        (0..2)
            .map(|n| (0..D).map(|d| ((n * D + d) as f32 * 0.61 + seed).cos()).collect())
            .collect()
    }

    fn tensor(rows: &[Vec<f32>]) -> Tensor {
        Tensor::from_vec(rows.concat(), (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
    }

    /// Read vectors computed with plain loops from the stored weights.
    fn reference(
        var_map: &VarMap,
        pre_memories: &[Vec<Vec<f32>>],
        control: &[Vec<f32>],
        image: &Tensor,
    ) -> Vec<Vec<f32>> {
        let (n_batch, _, h, w) = image.dims4().unwrap();
        let flat = image.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        (0..n_batch)
            .map(|n| {
                // cells[hw][d] = image[n][d][h][w]
                let cells: Vec<Vec<f32>> = (0..h * w)
                    .map(|hw| (0..D).map(|d| flat[(n * D + d) * h * w + hw]).collect())
                    .collect();
                let memories: Vec<Vec<f32>> = pre_memories
                    .iter()
                    .enumerate()
                    .map(|(k, m)| linear_ref(var_map, &format!("pre_memory_transformer_{k}"), &m[n]))
                    .collect();
                let scores: Vec<f32> = cells
                    .iter()
                    .map(|cell| {
                        let projected = linear_ref(var_map, "image_element_transformer", cell);
                        let mut joined = Vec::new();
                        for memory in &memories {
                            joined.extend(memory.iter().zip(&projected).map(|(m, p)| m * p));
                        }
                        joined.extend_from_slice(&projected);
                        let intermediate: Vec<f32> =
                            linear_ref(var_map, "intermediate_transformer", &joined)
                                .into_iter()
                                .map(|v| v.max(0.0))
                                .collect();
                        let gated: Vec<f32> = intermediate
                            .iter()
                            .zip(&control[n])
                            .map(|(x, c)| (x * c).max(0.0))
                            .collect();
                        linear_ref(var_map, "read_attention_transformer", &gated)[0]
                    })
                    .collect();
                let weights = softmax_ref(&scores, &vec![1.0; h * w]);
                (0..D)
                    .map(|d| cells.iter().zip(&weights).map(|(cell, a)| a * cell[d]).sum::<f32>())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn matches_reference_on_distinct_cells() {
        let var_map = VarMap::new();
        let unit = unit(2, &var_map);
        perturb_biases(&var_map);

        let data: Vec<f32> = (0..2 * D * 2 * 3)
            .map(|i| (i as f32 * 0.47 + 0.2).sin())
            .collect();
        let image = Tensor::from_vec(data, (2, D, 2, 3), &Device::Cpu).unwrap();
        let memories = vec![batch_rows(0.3), batch_rows(2.2)];
        let control = batch_rows(-0.9);

        let read = unit
            .forward(
                &[tensor(&memories[0]), tensor(&memories[1])],
                &tensor(&control),
                &image,
                false,
            )
            .unwrap();
        assert_rows_close(&read, &reference(&var_map, &memories, &control, &image), 1e-5);

        // Each parent goes through its own transformer.
        let swapped = unit
            .forward(
                &[tensor(&memories[1]), tensor(&memories[0])],
                &tensor(&control),
                &image,
                false,
            )
            .unwrap();
        let swapped_memories = [memories[1].clone(), memories[0].clone()];
        assert_rows_close(
            &swapped,
            &reference(&var_map, &swapped_memories, &control, &image),
            1e-5,
        );
    }
}
