//! The TMAC model: stem, reasoning tree and classifier.
//!
//! ## Forward pass
//!
//! 1. `q_drop = dropout(q)`; slot 0 of the control storage is `q_drop`,
//!    slot 0 of the memory storage is the learned initial memory.
//! 2. The step question is `tanh(W q_drop + b)`; each step's input unit
//!    projects it again.
//! 3. The image (plus optional coordinate channels) goes through the stem.
//! 4. Steps run from `S-1` down to `0`. Each step reads its parents'
//!    slots (the sentinel for a leaf), runs Control → Read → Write, and
//!    adds its control and memory into slot `step + 1`. The root's memory
//!    is kept aside and never stored.
//! 5. The classifier sees the root memory and the original question.

use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Dropout, Linear, Module, VarBuilder, VarMap};
use tmac_core::{ReasoningTree, TmacConfig, TmacError, UnitKind, UnitTable, ROOT_STEP};

use crate::control_unit::ControlUnit;
use crate::coords::append_coords;
use crate::init::{count_parameters, initialize_parameters, INIT_MEMORY_NAME};
use crate::input_unit::InputUnit;
use crate::output_unit::OutputUnit;
use crate::read_unit::ReadUnit;
use crate::stem::Stem;
use crate::storage::StepStorage;
use crate::write_unit::WriteUnit;

/// Root prefix of every parameter name.
pub const PARAM_PREFIX: &str = "tmac";

/// Encoded question: token context, pooled vector and token mask.
#[derive(Debug, Clone)]
pub struct Question {
    /// `(N, L, D)` per-token vectors.
    pub context: Tensor,
    /// `(N, D)` pooled question vector.
    pub pooled: Tensor,
    /// `(N, L)`; nonzero marks a valid token.
    pub mask: Tensor,
}

impl Question {
    pub fn new(context: Tensor, pooled: Tensor, mask: Tensor) -> Self {
        Self {
            context,
            pooled,
            mask,
        }
    }

    /// Checks the three shapes against each other and `module_dim`.
    /// Returns `(N, L)`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::ShapeMismatch`] if any shape disagrees.
    pub fn validate(&self, module_dim: usize) -> Result<(usize, usize), TmacError> {
        let shape_err = |what: &str, e: candle_core::Error| TmacError::ShapeMismatch {
            message: format!("{what}: {e}"),
        };
        let (n, l, d) = self
            .context
            .dims3()
            .map_err(|e| shape_err("question context must be (N, L, D)", e))?;
        let (pn, pd) = self
            .pooled
            .dims2()
            .map_err(|e| shape_err("pooled question must be (N, D)", e))?;
        let (mn, ml) = self
            .mask
            .dims2()
            .map_err(|e| shape_err("question mask must be (N, L)", e))?;

        if d != module_dim || pd != module_dim {
            return Err(TmacError::ShapeMismatch {
                message: format!(
                    "question width must be module_dim={module_dim}, got context {d} and pooled {pd}"
                ),
            });
        }
        if pn != n || mn != n || ml != l {
            return Err(TmacError::ShapeMismatch {
                message: format!(
                    "question batch/length disagree: context ({n}, {l}), pooled ({pn}), mask ({mn}, {ml})"
                ),
            });
        }
        Ok((n, l))
    }
}

/// Intermediate values captured by [`Tmac::forward_with_activations`].
#[derive(Debug, Clone)]
pub struct Activations {
    /// Stem output `(N, D, H', W')`.
    pub feats: Tensor,
    /// Step indices in the order they ran.
    pub step_order: Vec<usize>,
    /// Control output of each step, in `step_order`.
    pub control_outputs: Vec<Tensor>,
    /// Read vector of each step, in `step_order`.
    pub read_outputs: Vec<Tensor>,
    /// Memory output of each step (root included), in `step_order`.
    pub memory_outputs: Vec<Tensor>,
    /// Root memory handed to the classifier.
    pub classifier_input: Tensor,
    /// Final `(N, 1 + S, D)` control storage.
    pub control_storage: StepStorage,
    /// Final `(N, 1 + S, D)` memory storage; the root slot stays zero.
    pub memory_storage: StepStorage,
}

/// Number of instances built per unit kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitCounts {
    pub input: usize,
    pub control: usize,
    pub read: usize,
    pub write: usize,
}

/// A unit kind's instances plus its step → instance table.
#[derive(Debug)]
struct UnitSet<U> {
    table: UnitTable,
    units: Vec<U>,
}

impl<U> UnitSet<U> {
    fn build(
        table: UnitTable,
        mut make: impl FnMut(usize, VarBuilder) -> Result<U, TmacError>,
        vb: &VarBuilder,
    ) -> Result<Self, TmacError> {
        let units = (0..table.num_instances())
            .map(|i| make(table.instance_children(i), vb.pp(table.instance_label(i))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { table, units })
    }

    fn for_step(&self, step: usize) -> &U {
        &self.units[self.table.instance_for(step)]
    }
}

/// Tree-structured Compositional Attention Network.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use candle_nn::VarMap;
/// use tmac_core::TmacConfig;
/// use tmac_soft::model::{Question, Tmac};
///
/// let mut config = TmacConfig {
///     feature_dim: [3, 4, 4],
///     children_list: vec![vec![1, 2], vec![], vec![]],
///     module_dim: 8,
///     num_answers: 5,
///     ..TmacConfig::default()
/// };
/// config.classifier.fc_layers = vec![16];
///
/// let device = Device::Cpu;
/// let var_map = VarMap::new();
/// let model = Tmac::new(config, &var_map, &device).unwrap();
///
/// let image = Tensor::ones((2, 3, 4, 4), DType::F32, &device).unwrap();
/// let question = Question::new(
///     Tensor::ones((2, 6, 8), DType::F32, &device).unwrap(),
///     Tensor::ones((2, 8), DType::F32, &device).unwrap(),
///     Tensor::ones((2, 6), DType::F32, &device).unwrap(),
/// );
/// let logits = model.forward(&image, &question, false).unwrap();
/// assert_eq!(logits.dims(), &[2, 5]);
/// ```
pub struct Tmac {
    config: TmacConfig,
    tree: ReasoningTree,
    var_map: VarMap,
    device: Device,
    stem: Stem,
    input_units: UnitSet<InputUnit>,
    control_units: UnitSet<ControlUnit>,
    read_units: UnitSet<ReadUnit>,
    write_units: UnitSet<WriteUnit>,
    init_memory: Tensor,
    init_question_transformer: Linear,
    question_dropout: Dropout,
    classifier: OutputUnit,
    forward_count: AtomicU64,
}

impl std::fmt::Debug for Tmac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts = self.unit_counts();
        write!(
            f,
            "Tmac(steps={}, dim={}, units=[in {} ctl {} read {} write {}], answers={}, device={:?})",
            self.tree.num_steps(),
            self.config.module_dim,
            counts.input,
            counts.control,
            counts.read,
            counts.write,
            self.classifier.num_answers(),
            self.device,
        )
    }
}

impl Tmac {
    /// Builds a model whose parameters live in `var_map`, then initialises
    /// them from `config.init`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Config`] / [`TmacError::InvalidTopology`] for
    /// an invalid config and [`TmacError::Internal`] if parameter creation
    /// fails.
    pub fn new(config: TmacConfig, var_map: &VarMap, device: &Device) -> Result<Self, TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("Tmac new: {e}"),
        };

        config.validate()?;
        let tree = config.tree()?;
        let d = config.module_dim;
        let pattern = config.sharing_pattern();
        let vb = VarBuilder::from_varmap(var_map, DType::F32, device).pp(PARAM_PREFIX);

        let stem = Stem::new(config.stem_input_channels(), d, &config.stem, vb.pp("stem"))?;

        let resolve = |kind: UnitKind| UnitTable::resolve(kind, pattern.mode(kind), &tree);
        let input_units = UnitSet::build(
            resolve(UnitKind::Input)?,
            |_, vb| InputUnit::new(d, vb),
            &vb,
        )?;
        let use_prior = config.use_prior_control_in_control_unit;
        let control_units = UnitSet::build(
            resolve(UnitKind::Control)?,
            |k, vb| ControlUnit::new(k, d, use_prior, vb),
            &vb,
        )?;
        let read_dropout = config.read_dropout;
        let read_units = UnitSet::build(
            resolve(UnitKind::Read)?,
            |k, vb| ReadUnit::new(k, d, read_dropout, vb),
            &vb,
        )?;
        let write_units = UnitSet::build(
            resolve(UnitKind::Write)?,
            |k, vb| WriteUnit::new(k, d, vb),
            &vb,
        )?;

        let init_memory = vb
            .get_with_hints(d, INIT_MEMORY_NAME, candle_nn::Init::Const(0.0))
            .map_err(map_err)?;
        let init_question_transformer =
            linear(d, d, vb.pp("init_question_transformer")).map_err(map_err)?;
        let classifier = OutputUnit::new(
            d,
            &config.classifier,
            config.num_answers,
            vb.pp("classifier"),
        )?;

        initialize_parameters(var_map, PARAM_PREFIX, &config.init)?;

        let model = Self {
            question_dropout: Dropout::new(config.question_embedding_dropout),
            tree,
            var_map: var_map.clone(),
            device: device.clone(),
            stem,
            input_units,
            control_units,
            read_units,
            write_units,
            init_memory,
            init_question_transformer,
            classifier,
            forward_count: AtomicU64::new(0),
            config,
        };

        let counts = model.unit_counts();
        tracing::info!(
            steps = model.tree.num_steps(),
            arities = ?model.tree.distinct_arities(),
            input_units = counts.input,
            control_units = counts.control,
            read_units = counts.read,
            write_units = counts.write,
            params = model.param_count()?,
            "built TMAC model"
        );
        Ok(model)
    }

    /// Runs the model and returns `(N, num_answers)` logits.
    ///
    /// `image` is `(N, C, H, W)` with `C = feature_dim[0]`. Dropout and
    /// batch-norm statistics follow `train`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::ShapeMismatch`] for malformed inputs and
    /// propagates unit errors.
    pub fn forward(
        &self,
        image: &Tensor,
        question: &Question,
        train: bool,
    ) -> Result<Tensor, TmacError> {
        self.run(image, question, train, false).map(|(logits, _)| logits)
    }

    /// Like [`forward`](Self::forward), also returning the per-step
    /// control/memory outputs, storages and stem features.
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward).
    pub fn forward_with_activations(
        &self,
        image: &Tensor,
        question: &Question,
        train: bool,
    ) -> Result<(Tensor, Activations), TmacError> {
        let (logits, activations) = self.run(image, question, train, true)?;
        let activations = activations.ok_or_else(|| TmacError::Internal {
            message: "activations were not recorded".to_string(),
        })?;
        Ok((logits, activations))
    }

    fn run(
        &self,
        image: &Tensor,
        question: &Question,
        train: bool,
        record: bool,
    ) -> Result<(Tensor, Option<Activations>), TmacError> {
        let map_err = |e: candle_core::Error| TmacError::Internal {
            message: format!("Tmac forward: {e}"),
        };

        self.forward_count.fetch_add(1, Ordering::Relaxed);
        let d = self.config.module_dim;
        let (n, _) = question.validate(d)?;
        self.check_image(image, n)?;

        let mask = question.mask.to_dtype(DType::F32).map_err(map_err)?;
        let original_question = &question.pooled;

        let q_drop = self
            .question_dropout
            .forward(original_question, train)
            .map_err(map_err)?;
        let step_question = self
            .init_question_transformer
            .forward(&q_drop)
            .map_err(map_err)?
            .tanh()
            .map_err(map_err)?;

        let stem_input = if self.config.use_coords > 0 {
            append_coords(image)?
        } else {
            image.clone()
        };
        let feats = self.stem.forward(&stem_input, train)?;

        let init_memory = self
            .init_memory
            .unsqueeze(0)
            .map_err(map_err)?
            .broadcast_as((n, d))
            .map_err(map_err)?
            .contiguous()
            .map_err(map_err)?;
        let mut controls = StepStorage::new(&q_drop, self.tree.num_steps())?;
        let mut memories = StepStorage::new(&init_memory, self.tree.num_steps())?;

        let mut step_order = Vec::new();
        let mut control_outputs = Vec::new();
        let mut read_outputs = Vec::new();
        let mut memory_outputs = Vec::new();
        let mut final_memory = None;

        for step in self.tree.traversal_order() {
            let parent_slots = self.tree.parent_slots(step);
            let slot = self.tree.slot_of(step);
            tracing::debug!(
                step,
                arity = self.tree.arity(step),
                control_instance = self.control_units.table.instance_for(step),
                read_instance = self.read_units.table.instance_for(step),
                write_instance = self.write_units.table.instance_for(step),
                "reasoning step"
            );

            let step_q = self.input_units.for_step(step).forward(&step_question)?;

            let pre_controls = controls.gather(&parent_slots)?;
            let control = self.control_units.for_step(step).forward(
                &pre_controls,
                &step_q,
                &question.context,
                &mask,
            )?;
            controls.accumulate(slot, &control)?;
            let current_control = controls.slot(slot)?;

            let pre_memories = memories.gather(&parent_slots)?;
            let read = self.read_units.for_step(step).forward(
                &pre_memories,
                &current_control,
                &feats,
                train,
            )?;
            let memory = self.write_units.for_step(step).forward(
                &memories,
                &read,
                self.tree.children(step),
            )?;

            if record {
                step_order.push(step);
                control_outputs.push(control);
                read_outputs.push(read);
                memory_outputs.push(memory.clone());
            }

            if step == ROOT_STEP {
                final_memory = Some(memory);
            } else {
                memories.accumulate(slot, &memory)?;
            }
        }

        let final_memory = final_memory.ok_or_else(|| TmacError::Internal {
            message: "traversal finished without visiting the root".to_string(),
        })?;
        let logits = self
            .classifier
            .forward(&final_memory, original_question, train)?;

        let activations = record.then(|| Activations {
            feats,
            step_order,
            control_outputs,
            read_outputs,
            memory_outputs,
            classifier_input: final_memory,
            control_storage: controls,
            memory_storage: memories,
        });
        Ok((logits, activations))
    }

    fn check_image(&self, image: &Tensor, batch: usize) -> Result<(), TmacError> {
        let (n, c, _, _) = image.dims4().map_err(|e| TmacError::ShapeMismatch {
            message: format!("image batch must be (N, C, H, W): {e}"),
        })?;
        if n != batch {
            return Err(TmacError::ShapeMismatch {
                message: format!("image batch {n} does not match question batch {batch}"),
            });
        }
        if c != self.config.feature_dim[0] {
            return Err(TmacError::ShapeMismatch {
                message: format!(
                    "image has {c} channels, expected {}",
                    self.config.feature_dim[0]
                ),
            });
        }
        Ok(())
    }

    /// Number of forward calls so far.
    pub fn forward_count(&self) -> u64 {
        self.forward_count.load(Ordering::Relaxed)
    }

    /// Instances built per unit kind.
    pub fn unit_counts(&self) -> UnitCounts {
        UnitCounts {
            input: self.input_units.units.len(),
            control: self.control_units.units.len(),
            read: self.read_units.units.len(),
            write: self.write_units.units.len(),
        }
    }

    /// Step → instance table of a unit kind.
    pub fn unit_table(&self, kind: UnitKind) -> &UnitTable {
        match kind {
            UnitKind::Input => &self.input_units.table,
            UnitKind::Control => &self.control_units.table,
            UnitKind::Read => &self.read_units.table,
            UnitKind::Write => &self.write_units.table,
        }
    }

    /// The control unit instance `instance`, if it exists.
    pub fn control_unit(&self, instance: usize) -> Option<&ControlUnit> {
        self.control_units.units.get(instance)
    }

    /// Nominal fused input width `(K+1)·D` of control instance `instance`.
    pub fn control_unit_input_width(&self, instance: usize) -> Option<usize> {
        self.control_unit(instance).map(ControlUnit::input_width)
    }

    /// The read unit instance `instance`, if it exists.
    pub fn read_unit(&self, instance: usize) -> Option<&ReadUnit> {
        self.read_units.units.get(instance)
    }

    /// The write unit instance `instance`, if it exists.
    pub fn write_unit(&self, instance: usize) -> Option<&WriteUnit> {
        self.write_units.units.get(instance)
    }

    /// Total number of trainable scalars.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Internal`] if the var map lock is poisoned.
    pub fn param_count(&self) -> Result<usize, TmacError> {
        count_parameters(&self.var_map, PARAM_PREFIX)
    }

    /// The reasoning tree.
    pub fn tree(&self) -> &ReasoningTree {
        &self.tree
    }

    /// The configuration the model was built from.
    pub fn config(&self) -> &TmacConfig {
        &self.config
    }

    /// Device holding the parameters.
    pub fn device(&self) -> &Device {
        &self.device
    }
}
