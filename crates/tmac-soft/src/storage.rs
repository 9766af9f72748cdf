//! Per-step control/memory storage.
//!
//! A [`StepStorage`] is an `(N, 1 + S, D)` tensor: slot 0 holds the
//! sentinel (initial control or memory), slot `i + 1` holds step `i`'s
//! output. Slots start at zero and are written at most once per forward
//! pass.
//!
//! Writes are versioned: [`StepStorage::accumulate`] builds a new tensor
//! with the updated slot rather than mutating the old one, so any view a
//! downstream step already took of the previous version stays valid and
//! the computation graph keeps one node per write.

use candle_core::Tensor;
use tmac_core::{TmacError, SENTINEL_SLOT};

/// Versioned `(N, 1 + S, D)` store of per-step vectors.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use tmac_soft::storage::StepStorage;
///
/// let sentinel = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
/// let mut storage = StepStorage::new(&sentinel, 3).unwrap();
/// assert_eq!(storage.tensor().dims(), &[2, 4, 4]);
///
/// let out = Tensor::full(0.5f32, (2, 4), &Device::Cpu).unwrap();
/// storage.accumulate(3, &out).unwrap();
/// assert!(storage.is_written(3));
/// assert!(storage.accumulate(3, &out).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct StepStorage {
    data: Tensor,
    written: Vec<bool>,
    version: usize,
}

impl StepStorage {
    /// Zero storage for `num_steps` steps with `sentinel` `(N, D)` in slot 0.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::ShapeMismatch`] if `sentinel` is not rank 2.
    pub fn new(sentinel: &Tensor, num_steps: usize) -> Result<Self, TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("StepStorage new: {e}"),
        };

        let (n, d) = sentinel.dims2().map_err(|e| TmacError::ShapeMismatch {
            message: format!("sentinel must be (N, D): {e}"),
        })?;
        let zeros = Tensor::zeros((n, num_steps, d), sentinel.dtype(), sentinel.device())
            .map_err(map_err)?;
        let data = Tensor::cat(&[&sentinel.unsqueeze(1).map_err(map_err)?, &zeros], 1)
            .map_err(map_err)?;

        let mut written = vec![false; num_steps + 1];
        written[SENTINEL_SLOT] = true;

        Ok(Self {
            data,
            written,
            version: 0,
        })
    }

    /// The current `(N, 1 + S, D)` tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.data
    }

    /// Number of slots, sentinel included.
    pub fn num_slots(&self) -> usize {
        self.written.len()
    }

    /// Number of writes since construction.
    pub fn version(&self) -> usize {
        self.version
    }

    /// Returns `true` if `slot` holds a value (the sentinel always does).
    pub fn is_written(&self, slot: usize) -> bool {
        self.written.get(slot).copied().unwrap_or(false)
    }

    /// The `(N, D)` vector stored in `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::StorageViolation`] if `slot` is out of range.
    pub fn slot(&self, slot: usize) -> Result<Tensor, TmacError> {
        if slot >= self.num_slots() {
            return Err(TmacError::StorageViolation {
                message: format!("slot {slot} out of range ({} slots)", self.num_slots()),
            });
        }
        self.data
            .narrow(1, slot, 1)
            .and_then(|t| t.squeeze(1))
            .map_err(|e| TmacError::Internal {
                message: format!("StepStorage slot: {e}"),
            })
    }

    /// The vectors stored in `slots`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::StorageViolation`] if a slot is out of range
    /// or has not been written yet.
    pub fn gather(&self, slots: &[usize]) -> Result<Vec<Tensor>, TmacError> {
        slots
            .iter()
            .map(|&slot| {
                if !self.is_written(slot) {
                    return Err(TmacError::StorageViolation {
                        message: format!("slot {slot} read before it was written"),
                    });
                }
                self.slot(slot)
            })
            .collect()
    }

    /// Adds `value` `(N, D)` into `slot`, producing a new storage version.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::StorageViolation`] for the sentinel slot, an
    /// out-of-range slot, or a slot that was already written.
    pub fn accumulate(&mut self, slot: usize, value: &Tensor) -> Result<(), TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("StepStorage accumulate: {e}"),
        };

        if slot == SENTINEL_SLOT {
            return Err(TmacError::StorageViolation {
                message: "the sentinel slot is read-only".to_string(),
            });
        }
        if self.is_written(slot) {
            return Err(TmacError::StorageViolation {
                message: format!("slot {slot} already written"),
            });
        }

        let updated = (self.slot(slot)? + value).map_err(map_err)?;
        let (n, _, d) = self.data.dims3().map_err(map_err)?;
        self.data = self
            .data
            .slice_assign(&[0..n, slot..slot + 1, 0..d], &updated.unsqueeze(1).map_err(map_err)?)
            .map_err(map_err)?;

        self.written[slot] = true;
        self.version += 1;
        tracing::trace!(slot, version = self.version, "storage write");
        Ok(())
    }
}
