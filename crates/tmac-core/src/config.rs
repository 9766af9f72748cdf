//! Construction-time configuration for a TMAC model.
//!
//! All options are fixed for the lifetime of the model. Configs are
//! plain serde structs so they can be loaded from the JSON files that
//! accompany checkpoints.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::TmacError;
use crate::sharing::SharingPattern;
use crate::topology::ReasoningTree;

/// Convolutional stem hyperparameters.
///
/// Per-layer vectors may hold a single entry, which then applies to
/// every layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StemConfig {
    /// Number of conv layers (default: 2). Zero means the image features
    /// are used as-is and must already have `module_dim` channels.
    pub num_layers: usize,
    /// Batch normalisation after each conv (default: false).
    pub batchnorm: bool,
    /// Kernel size per layer (default: `[3]`).
    pub kernel_size: Vec<usize>,
    /// Stride per layer (default: `[1]`).
    pub stride: Vec<usize>,
    /// Padding per layer; `None` pads by `kernel_size / 2`.
    pub padding: Option<Vec<usize>>,
    /// Layers followed by a 2×2 max-pool.
    pub subsample_layers: Vec<usize>,
}

impl Default for StemConfig {
    fn default() -> Self {
        Self {
            num_layers: 2,
            batchnorm: false,
            kernel_size: vec![3],
            stride: vec![1],
            padding: None,
            subsample_layers: Vec::new(),
        }
    }
}

impl StemConfig {
    /// Kernel size of `layer`.
    pub fn kernel_size_at(&self, layer: usize) -> usize {
        per_layer(&self.kernel_size, layer, 3)
    }

    /// Stride of `layer`.
    pub fn stride_at(&self, layer: usize) -> usize {
        per_layer(&self.stride, layer, 1)
    }

    /// Padding of `layer`, defaulting to half the kernel size.
    pub fn padding_at(&self, layer: usize) -> usize {
        match &self.padding {
            Some(p) => per_layer(p, layer, self.kernel_size_at(layer) / 2),
            None => self.kernel_size_at(layer) / 2,
        }
    }

    /// Returns `true` if `layer` is followed by max-pooling.
    pub fn subsamples(&self, layer: usize) -> bool {
        self.subsample_layers.contains(&layer)
    }

    fn validate(&self) -> Result<(), TmacError> {
        let check = |name: &str, values: &[usize]| {
            if values.len() > 1 && values.len() < self.num_layers {
                return Err(TmacError::Config {
                    message: format!(
                        "stem.{name} has {} entries for {} layers",
                        values.len(),
                        self.num_layers
                    ),
                });
            }
            Ok(())
        };
        check("kernel_size", &self.kernel_size)?;
        check("stride", &self.stride)?;
        if let Some(padding) = &self.padding {
            check("padding", padding)?;
        }
        if (0..self.num_layers).any(|l| self.kernel_size_at(l) == 0 || self.stride_at(l) == 0) {
            return Err(TmacError::Config {
                message: "stem kernel sizes and strides must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn per_layer(values: &[usize], layer: usize, fallback: usize) -> usize {
    match values.len() {
        0 => fallback,
        1 => values[0],
        _ => values.get(layer).copied().unwrap_or(fallback),
    }
}

/// Classifier (output unit) hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Hidden layer widths (default: `[512]`).
    pub fc_layers: Vec<usize>,
    /// Batch normalisation before each linear layer (default: false).
    pub batchnorm: bool,
    /// Dropout before each linear layer (default: 0.0).
    pub dropout: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            fc_layers: vec![512],
            batchnorm: false,
            dropout: 0.0,
        }
    }
}

/// Xavier/Glorot variant used for weight initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitScheme {
    /// `U(-b, b)` with `b = sqrt(6 / (fan_in + fan_out))`.
    Uniform,
    /// `N(0, s²)` with `s = sqrt(2 / (fan_in + fan_out))`.
    Normal,
}

/// Weight initialisation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// Distribution for conv/linear weights (default: uniform).
    pub scheme: InitScheme,
    /// Seed of the generator every parameter is drawn from (default: 42).
    pub seed: u64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            scheme: InitScheme::Uniform,
            seed: 42,
        }
    }
}

/// Answer vocabulary; only its size matters to the model.
///
/// # Example
///
/// ```
/// use tmac_core::Vocab;
///
/// let vocab: Vocab = serde_json::from_str(r#"{"answer_idx_to_token": ["yes", "no"]}"#).unwrap();
/// assert_eq!(vocab.num_answers(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocab {
    pub answer_idx_to_token: Vec<String>,
}

impl Vocab {
    /// Number of answer classes.
    pub fn num_answers(&self) -> usize {
        self.answer_idx_to_token.len()
    }
}

/// Full model configuration.
///
/// # Example
///
/// ```
/// use tmac_core::TmacConfig;
///
/// let config = TmacConfig::default();
/// assert!(config.validate().is_ok());
/// assert_eq!(config.children_list.len(), 7);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmacConfig {
    /// Image feature shape `[C, H, W]` fed to the stem.
    pub feature_dim: [usize; 3],
    /// Convolutional stem settings.
    pub stem: StemConfig,
    /// Child indices of every reasoning step; defines the tree.
    pub children_list: Vec<Vec<usize>>,
    /// Width `D` of control, memory, read and question vectors.
    pub module_dim: usize,
    /// Dropout on the pooled question vector.
    pub question_embedding_dropout: f32,
    /// Dropout inside the read unit.
    pub read_dropout: f32,
    /// Fuse parent controls into the control unit's query.
    pub use_prior_control_in_control_unit: bool,
    /// Sharing flags for `[input, control, read, write]`; JSON accepts
    /// booleans or 0/1.
    #[serde(deserialize_with = "deserialize_flags")]
    pub sharing_params_patterns: [bool; 4],
    /// Classifier settings.
    pub classifier: ClassifierConfig,
    /// Nonzero appends two coordinate channels to the stem input.
    pub use_coords: u32,
    /// Number of answer classes.
    pub num_answers: usize,
    /// Weight initialisation.
    pub init: InitConfig,
}

impl Default for TmacConfig {
    fn default() -> Self {
        Self {
            feature_dim: [1024, 14, 14],
            stem: StemConfig::default(),
            children_list: vec![
                vec![1, 2],
                vec![3, 4],
                vec![5, 6],
                vec![],
                vec![],
                vec![],
                vec![],
            ],
            module_dim: 512,
            question_embedding_dropout: 0.08,
            read_dropout: 0.15,
            use_prior_control_in_control_unit: false,
            sharing_params_patterns: [true, true, true, true],
            classifier: ClassifierConfig::default(),
            use_coords: 1,
            num_answers: 32,
            init: InitConfig::default(),
        }
    }
}

impl TmacConfig {
    /// Parses a config from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Config`] if the JSON is malformed.
    ///
    /// # Example
    ///
    /// ```
    /// use tmac_core::TmacConfig;
    ///
    /// let config = TmacConfig::from_json_str(
    ///     r#"{"module_dim": 8, "children_list": [[1], []], "sharing_params_patterns": [1, 0, 1, 0]}"#,
    /// ).unwrap();
    /// assert_eq!(config.module_dim, 8);
    /// assert_eq!(config.sharing_params_patterns, [true, false, true, false]);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self, TmacError> {
        serde_json::from_str(json).map_err(|e| TmacError::Config {
            message: format!("failed to parse config: {e}"),
        })
    }

    /// Reads and parses a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Config`] if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TmacError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| TmacError::Config {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    /// Sizes the classifier from an answer vocabulary.
    pub fn with_vocab(mut self, vocab: &Vocab) -> Self {
        self.num_answers = vocab.num_answers();
        self
    }

    /// Resolved sharing flags.
    pub fn sharing_pattern(&self) -> SharingPattern {
        SharingPattern::from_flags(self.sharing_params_patterns)
    }

    /// Channels entering the stem: image channels plus optional coordinates.
    pub fn stem_input_channels(&self) -> usize {
        self.feature_dim[0] + if self.use_coords > 0 { 2 } else { 0 }
    }

    /// Builds the reasoning tree described by `children_list`.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::InvalidTopology`] for an invalid list.
    pub fn tree(&self) -> Result<ReasoningTree, TmacError> {
        ReasoningTree::new(self.children_list.clone())
    }

    /// Checks every option for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`TmacError::Config`] for out-of-range options and
    /// [`TmacError::InvalidTopology`] for a bad `children_list`.
    pub fn validate(&self) -> Result<(), TmacError> {
        if self.module_dim == 0 {
            return Err(TmacError::Config {
                message: "module_dim must be positive".to_string(),
            });
        }
        if self.num_answers == 0 {
            return Err(TmacError::Config {
                message: "num_answers must be positive".to_string(),
            });
        }
        if self.feature_dim.iter().any(|&d| d == 0) {
            return Err(TmacError::Config {
                message: format!("feature_dim {:?} has a zero extent", self.feature_dim),
            });
        }
        for (name, rate) in [
            ("question_embedding_dropout", self.question_embedding_dropout),
            ("read_dropout", self.read_dropout),
            ("classifier.dropout", self.classifier.dropout),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(TmacError::Config {
                    message: format!("{name} must be in [0, 1), got {rate}"),
                });
            }
        }
        if self.classifier.fc_layers.contains(&0) {
            return Err(TmacError::Config {
                message: "classifier.fc_layers entries must be positive".to_string(),
            });
        }
        self.stem.validate()?;
        if self.stem.num_layers == 0 && self.stem_input_channels() != self.module_dim {
            return Err(TmacError::Config {
                message: format!(
                    "without stem layers the image must have module_dim={} channels, got {}",
                    self.module_dim,
                    self.stem_input_channels()
                ),
            });
        }
        self.tree()?;
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

fn deserialize_flags<'de, D>(deserializer: D) -> Result<[bool; 4], D::Error>
where
    D: Deserializer<'de>,
{
    let raw: [Flag; 4] = Deserialize::deserialize(deserializer)?;
    Ok(raw.map(|flag| match flag {
        Flag::Bool(b) => b,
        Flag::Int(i) => i == 1,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        TmacConfig::default().validate().unwrap();
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config = TmacConfig::from_json_str("{}").unwrap();
        assert_eq!(config, TmacConfig::default());
    }

    #[test]
    fn sharing_flags_accept_booleans_and_integers() {
        let config =
            TmacConfig::from_json_str(r#"{"sharing_params_patterns": [true, 0, 1, false]}"#)
                .unwrap();
        assert_eq!(config.sharing_params_patterns, [true, false, true, false]);
    }

    #[test]
    fn only_one_counts_as_shared() {
        let config =
            TmacConfig::from_json_str(r#"{"sharing_params_patterns": [2, 1, 1, 1]}"#).unwrap();
        assert!(!config.sharing_params_patterns[0]);
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = TmacConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, TmacError::Config { .. }));
    }

    #[test]
    fn dropout_out_of_range_rejected() {
        let config = TmacConfig {
            read_dropout: 1.0,
            ..TmacConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("read_dropout"));
    }

    #[test]
    fn bad_topology_surfaces_from_validate() {
        let config = TmacConfig {
            children_list: vec![vec![3]],
            ..TmacConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TmacError::InvalidTopology { .. })
        ));
    }

    #[test]
    fn stemless_config_needs_module_dim_channels() {
        let mut config = TmacConfig {
            feature_dim: [6, 2, 2],
            module_dim: 8,
            use_coords: 1,
            ..TmacConfig::default()
        };
        config.stem.num_layers = 0;
        assert!(config.validate().is_ok());
        config.use_coords = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn stem_per_layer_lookup() {
        let stem = StemConfig {
            num_layers: 3,
            kernel_size: vec![3, 5, 1],
            stride: vec![1],
            padding: None,
            ..StemConfig::default()
        };
        assert_eq!(stem.kernel_size_at(1), 5);
        assert_eq!(stem.stride_at(2), 1);
        assert_eq!(stem.padding_at(1), 2);
        assert_eq!(stem.padding_at(2), 0);
    }

    #[test]
    fn short_stem_vectors_rejected() {
        let mut config = TmacConfig::default();
        config.stem.num_layers = 3;
        config.stem.kernel_size = vec![3, 3];
        assert!(config.validate().is_err());
    }

    #[test]
    fn vocab_sizes_classifier() {
        let vocab = Vocab {
            answer_idx_to_token: vec!["yes".into(), "no".into(), "2".into()],
        };
        let config = TmacConfig::default().with_vocab(&vocab);
        assert_eq!(config.num_answers, 3);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"module_dim": 16, "num_answers": 4}}"#).unwrap();
        let config = TmacConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.module_dim, 16);
        assert_eq!(config.num_answers, 4);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = TmacConfig::from_json_file("/nonexistent/tmac.json").unwrap_err();
        assert!(matches!(err, TmacError::Config { .. }));
    }

    #[test]
    fn round_trips_through_json() {
        let config = TmacConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(TmacConfig::from_json_str(&json).unwrap(), config);
    }
}
