//! Parameter sharing across reasoning steps.
//!
//! Each unit kind is instantiated in one of three granularities:
//!
//! - [`SharingMode::Shared`]: one instance for every step
//! - [`SharingMode::PerArity`]: one instance per distinct child count
//! - [`SharingMode::PerStep`]: one instance per step
//!
//! The choice is resolved once into a [`UnitTable`] mapping each step to
//! an instance index, so the forward pass dispatches with a single lookup.

use std::fmt;

use crate::error::TmacError;
use crate::topology::{effective_arity, ReasoningTree};

/// The four unit kinds of a reasoning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// Per-step projection of the question vector.
    Input,
    /// Attention over the question context.
    Control,
    /// Attention over the image features.
    Read,
    /// Fusion of parent memories with the read vector.
    Write,
}

impl UnitKind {
    /// All kinds, in `sharing_params_patterns` order.
    pub const ALL: [UnitKind; 4] = [Self::Input, Self::Control, Self::Read, Self::Write];

    /// Parameter-name stem used for instances of this kind.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Input => "input_unit",
            Self::Control => "control_unit",
            Self::Read => "read_unit",
            Self::Write => "write_unit",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Granularity at which a unit kind's parameters are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingMode {
    /// A single instance serves every step.
    Shared,
    /// One instance per distinct child count.
    PerArity,
    /// One instance per step.
    PerStep,
}

/// The four `sharing_params_patterns` flags, one per [`UnitKind`].
///
/// A set flag means "share": the Input unit then becomes a single
/// instance, while Control/Read/Write share within an arity group (their
/// input widths depend on the child count, so they cannot share further).
///
/// # Example
///
/// ```
/// use tmac_core::{SharingMode, SharingPattern, UnitKind};
///
/// let pattern = SharingPattern::from_flags([true, true, false, true]);
/// assert_eq!(pattern.mode(UnitKind::Input), SharingMode::Shared);
/// assert_eq!(pattern.mode(UnitKind::Control), SharingMode::PerArity);
/// assert_eq!(pattern.mode(UnitKind::Read), SharingMode::PerStep);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharingPattern {
    pub input: bool,
    pub control: bool,
    pub read: bool,
    pub write: bool,
}

impl SharingPattern {
    /// Builds a pattern from flags in `[input, control, read, write]` order.
    pub fn from_flags(flags: [bool; 4]) -> Self {
        let [input, control, read, write] = flags;
        Self {
            input,
            control,
            read,
            write,
        }
    }

    /// Resolved sharing mode for a unit kind.
    pub fn mode(&self, kind: UnitKind) -> SharingMode {
        let (flag, shared_mode) = match kind {
            UnitKind::Input => (self.input, SharingMode::Shared),
            UnitKind::Control => (self.control, SharingMode::PerArity),
            UnitKind::Read => (self.read, SharingMode::PerArity),
            UnitKind::Write => (self.write, SharingMode::PerArity),
        };
        if flag {
            shared_mode
        } else {
            SharingMode::PerStep
        }
    }
}

/// Step → instance lookup for one unit kind.
///
/// # Example
///
/// ```
/// use tmac_core::{ReasoningTree, SharingMode, UnitKind, UnitTable};
///
/// let tree = ReasoningTree::new(vec![vec![1, 2], vec![], vec![]]).unwrap();
/// let table = UnitTable::resolve(UnitKind::Control, SharingMode::PerArity, &tree).unwrap();
/// assert_eq!(table.num_instances(), 2);
/// assert_eq!(table.instance_for(1), table.instance_for(2));
/// assert_ne!(table.instance_for(0), table.instance_for(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitTable {
    kind: UnitKind,
    mode: SharingMode,
    /// Raw child count each instance was built for.
    instance_children: Vec<usize>,
    step_to_instance: Vec<usize>,
}

impl UnitTable {
    /// Resolves the instance layout of `kind` over `tree`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Config`] if `Shared` is requested for an
    /// arity-dependent kind while the tree mixes parent counts.
    pub fn resolve(
        kind: UnitKind,
        mode: SharingMode,
        tree: &ReasoningTree,
    ) -> Result<Self, TmacError> {
        let num_steps = tree.num_steps();
        let (instance_children, step_to_instance) = match mode {
            SharingMode::Shared => {
                if kind != UnitKind::Input {
                    let widths: Vec<usize> = (0..num_steps)
                        .map(|s| tree.effective_arity(s))
                        .collect();
                    if widths.iter().any(|&w| w != widths[0]) {
                        return Err(TmacError::Config {
                            message: format!(
                                "{kind} cannot be fully shared across steps with different child counts"
                            ),
                        });
                    }
                }
                (vec![tree.arity(0)], vec![0; num_steps])
            }
            SharingMode::PerArity => {
                let arities = tree.distinct_arities();
                let step_to_instance = (0..num_steps)
                    .map(|s| {
                        arities
                            .binary_search(&tree.arity(s))
                            .map_err(|_| TmacError::Internal {
                                message: format!("arity of step {s} missing from arity groups"),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                (arities, step_to_instance)
            }
            SharingMode::PerStep => (
                (0..num_steps).map(|s| tree.arity(s)).collect(),
                (0..num_steps).collect(),
            ),
        };

        Ok(Self {
            kind,
            mode,
            instance_children,
            step_to_instance,
        })
    }

    /// Unit kind this table dispatches.
    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Sharing mode the table was resolved with.
    pub fn mode(&self) -> SharingMode {
        self.mode
    }

    /// Number of distinct instances.
    pub fn num_instances(&self) -> usize {
        self.instance_children.len()
    }

    /// Instance index serving `step`.
    ///
    /// # Panics
    ///
    /// Panics if `step` is not a step of the tree the table was built for.
    pub fn instance_for(&self, step: usize) -> usize {
        self.step_to_instance[step]
    }

    /// Raw child count instance `instance` was built for.
    pub fn instance_children(&self, instance: usize) -> usize {
        self.instance_children[instance]
    }

    /// Number of parent vectors instance `instance` accepts.
    pub fn instance_arity(&self, instance: usize) -> usize {
        effective_arity(self.instance_children[instance])
    }

    /// Parameter-name prefix of an instance, e.g. `read_unit_arity2`.
    pub fn instance_label(&self, instance: usize) -> String {
        match self.mode {
            SharingMode::Shared => self.kind.label().to_string(),
            SharingMode::PerArity => {
                format!("{}_arity{}", self.kind.label(), self.instance_children[instance])
            }
            SharingMode::PerStep => format!("{}_{}", self.kind.label(), instance),
        }
    }
}
