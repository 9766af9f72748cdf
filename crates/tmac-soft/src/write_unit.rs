//! Write unit: fuses parent memories with the new read vector.
//!
//! ```text
//! memory = W_m [m_1 ‖ … ‖ m_K ‖ read] + b_m
//! ```
//!
//! The fusion is affine; there is no nonlinearity after it.

use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};
use tmac_core::topology::effective_arity;
use tmac_core::{TmacError, SENTINEL_SLOT};

use crate::storage::StepStorage;

/// Affine memory update.
#[derive(Debug, Clone)]
pub struct WriteUnit {
    num_parents: usize,
    control_memory_transformer: Linear,
}

impl WriteUnit {
    /// Creates a write unit for steps with `num_children` children.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Internal`] if parameter creation fails.
    pub fn new(num_children: usize, module_dim: usize, vb: VarBuilder) -> Result<Self, TmacError> {
        let num_parents = effective_arity(num_children);
        let control_memory_transformer = linear(
            (num_parents + 1) * module_dim,
            module_dim,
            vb.pp("control_memory_transformer"),
        )
        .map_err(|e| TmacError::Internal {
            message: format!("WriteUnit new: {e}"),
        })?;
        Ok(Self {
            num_parents,
            control_memory_transformer,
        })
    }

    /// Number of parent memories this unit accepts.
    pub fn num_parents(&self) -> usize {
        self.num_parents
    }

    /// Gathers the memories of `children` from `memories` (the sentinel
    /// for a leaf) and fuses them with `current_read` `(N, D)`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::ChildCountMismatch`] if the number of parents
    /// differs from the unit's arity, or [`TmacError::StorageViolation`]
    /// if a child's slot has not been written.
    pub fn forward(
        &self,
        memories: &StepStorage,
        current_read: &Tensor,
        children: &[usize],
    ) -> Result<Tensor, TmacError> {
        let slots: Vec<usize> = if children.is_empty() {
            vec![SENTINEL_SLOT]
        } else {
            children.iter().map(|&c| c + 1).collect()
        };
        if slots.len() != self.num_parents {
            return Err(TmacError::ChildCountMismatch {
                unit: "WriteUnit".to_string(),
                expected: self.num_parents,
                got: slots.len(),
            });
        }
        let prior = memories.gather(&slots)?;
        self.fuse(&prior, current_read)
    }

    /// The affine fusion on already gathered parent memories.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::ChildCountMismatch`] if `prior_memories.len()`
    /// differs from the unit's arity.
    pub fn fuse(&self, prior_memories: &[Tensor], current_read: &Tensor) -> Result<Tensor, TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("WriteUnit forward: {e}"),
        };

        if prior_memories.len() != self.num_parents {
            return Err(TmacError::ChildCountMismatch {
                unit: "WriteUnit".to_string(),
                expected: self.num_parents,
                got: prior_memories.len(),
            });
        }

        let mut parts: Vec<&Tensor> = prior_memories.iter().collect();
        parts.push(current_read);
        let joined = Tensor::cat(&parts, 1).map_err(map_err)?;
        self.control_memory_transformer
            .forward(&joined)
            .map_err(map_err)
    }

    /// The fusion layer's weight `(D, (K+1)·D)` and bias `(D,)`.
    pub fn parameters(&self) -> (&Tensor, Option<&Tensor>) {
        (
            self.control_memory_transformer.weight(),
            self.control_memory_transformer.bias(),
        )
    }
}
