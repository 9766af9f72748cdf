//! The reasoning tree: which steps feed which.
//!
//! Steps are numbered `0..S`. Step `i` lists the steps whose control and
//! memory outputs it consumes (its children). Children always carry a
//! larger index than their parent, so walking the indices from `S-1` down
//! to `0` computes every child before the step that reads it. Step 0 is
//! the root; its memory output is the answer representation.
//!
//! Storage slots are offset by one: step `i` writes slot `i + 1`, and slot
//! 0 is the sentinel holding the initial control and memory. Leaf steps
//! read the sentinel as their single parent.

use std::collections::BTreeSet;

use crate::error::TmacError;

/// Index of the root step, processed last.
pub const ROOT_STEP: usize = 0;

/// Storage slot holding the initial control/memory vectors.
pub const SENTINEL_SLOT: usize = 0;

/// A validated, immutable reasoning tree.
///
/// # Example
///
/// ```
/// use tmac_core::ReasoningTree;
///
/// // Root with two leaf children.
/// let tree = ReasoningTree::new(vec![vec![1, 2], vec![], vec![]]).unwrap();
/// assert_eq!(tree.num_steps(), 3);
/// assert_eq!(tree.traversal_order().collect::<Vec<_>>(), vec![2, 1, 0]);
/// assert_eq!(tree.parent_slots(0), vec![2, 3]);
/// assert_eq!(tree.parent_slots(1), vec![0]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningTree {
    children: Vec<Vec<usize>>,
}

impl ReasoningTree {
    /// Validates a `children_list` and builds the tree.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::InvalidTopology`] if the list is empty, a child
    /// index is out of range, or a child index is not strictly greater
    /// than its parent's. A step may list the same child more than once;
    /// that child's slot is then read once per listing.
    ///
    /// # Example
    ///
    /// ```
    /// use tmac_core::{ReasoningTree, TmacError};
    ///
    /// // Step 1 may not consume step 0.
    /// let err = ReasoningTree::new(vec![vec![1], vec![0]]).unwrap_err();
    /// assert!(matches!(err, TmacError::InvalidTopology { .. }));
    /// ```
    pub fn new(children_list: Vec<Vec<usize>>) -> Result<Self, TmacError> {
        let num_steps = children_list.len();
        if num_steps == 0 {
            return Err(TmacError::InvalidTopology {
                message: "children_list must contain at least one step".to_string(),
            });
        }

        for (step, children) in children_list.iter().enumerate() {
            for &child in children {
                if child >= num_steps {
                    return Err(TmacError::InvalidTopology {
                        message: format!(
                            "step {step} lists child {child}, but only {num_steps} steps exist"
                        ),
                    });
                }
                if child <= step {
                    return Err(TmacError::InvalidTopology {
                        message: format!(
                            "step {step} lists child {child}; children must have a larger index than their parent"
                        ),
                    });
                }
            }
        }

        Ok(Self {
            children: children_list,
        })
    }

    /// Number of reasoning steps `S`.
    pub fn num_steps(&self) -> usize {
        self.children.len()
    }

    /// Number of storage slots, `1 + S` (sentinel included).
    pub fn num_slots(&self) -> usize {
        self.children.len() + 1
    }

    /// Declared children of `step`.
    ///
    /// # Panics
    ///
    /// Panics if `step >= num_steps()`.
    pub fn children(&self, step: usize) -> &[usize] {
        &self.children[step]
    }

    /// The raw `children_list` this tree was built from.
    pub fn children_list(&self) -> &[Vec<usize>] {
        &self.children
    }

    /// Number of declared children of `step`.
    pub fn arity(&self, step: usize) -> usize {
        self.children[step].len()
    }

    /// Number of parent vectors `step` consumes: its child count, or 1 for
    /// a leaf (the sentinel).
    ///
    /// The same convention sizes the Control, Read and Write units.
    ///
    /// # Example
    ///
    /// ```
    /// use tmac_core::ReasoningTree;
    ///
    /// let tree = ReasoningTree::new(vec![vec![1, 2], vec![], vec![]]).unwrap();
    /// assert_eq!(tree.effective_arity(0), 2);
    /// assert_eq!(tree.effective_arity(1), 1);
    /// ```
    pub fn effective_arity(&self, step: usize) -> usize {
        effective_arity(self.arity(step))
    }

    /// Returns `true` if `step` has no children.
    pub fn is_leaf(&self, step: usize) -> bool {
        self.children[step].is_empty()
    }

    /// Storage slot written by `step`.
    pub fn slot_of(&self, step: usize) -> usize {
        step + 1
    }

    /// Storage slots `step` reads its parent control/memory vectors from.
    ///
    /// Children map to `child + 1`; a leaf reads only [`SENTINEL_SLOT`].
    pub fn parent_slots(&self, step: usize) -> Vec<usize> {
        let children = &self.children[step];
        if children.is_empty() {
            vec![SENTINEL_SLOT]
        } else {
            children.iter().map(|&c| c + 1).collect()
        }
    }

    /// Step indices in processing order: `S-1` down to `0`.
    pub fn traversal_order(&self) -> impl Iterator<Item = usize> {
        (0..self.children.len()).rev()
    }

    /// Sorted distinct child counts present in the tree.
    ///
    /// Groups are keyed by the raw count, so leaves (0) and single-child
    /// steps (1) form separate groups even though both consume one parent.
    ///
    /// # Example
    ///
    /// ```
    /// use tmac_core::ReasoningTree;
    ///
    /// let tree = ReasoningTree::new(vec![vec![1, 2], vec![3], vec![], vec![]]).unwrap();
    /// assert_eq!(tree.distinct_arities(), vec![0, 1, 2]);
    /// ```
    pub fn distinct_arities(&self) -> Vec<usize> {
        self.children
            .iter()
            .map(Vec::len)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Parent-vector count for a raw child count (`0` counts as one sentinel).
pub fn effective_arity(num_children: usize) -> usize {
    num_children.max(1)
}
