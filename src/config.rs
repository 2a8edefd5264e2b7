// SPDX-License-Identifier: MIT OR Apache-2.0

//! Alignment configuration and `HuggingFace` `config.json` parsing.
//!
//! [`AlignableConfig`] lists the intervention points of an
//! [`AlignableModel`](crate::AlignableModel), the mode in which their
//! sources are combined, and the built-in transform used at each point.
//! [`ModelDims`] carries the handful of model dimensions the module
//! mapping needs to size each point's feature dimension.
//!
//! # Usage
//!
//! ```
//! use candle_align::{AlignableConfig, Mode, RepresentationKind};
//!
//! let config = AlignableConfig::from_json_str(r#"{
//!     "mode": "parallel",
//!     "representations": [
//!         {"layer": 3, "representation_kind": "block_output", "unit": "pos", "max_units": 1}
//!     ],
//!     "intervention_types": "vanilla"
//! }"#).unwrap();
//! assert_eq!(config.mode, Mode::Parallel);
//! assert_eq!(config.representations[0].representation_kind, RepresentationKind::BlockOutput);
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AlignError, Result};

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// How multiple sources are combined into the base run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Every source is captured independently and all setters fire in one
    /// base pass.
    #[default]
    Parallel,
    /// Source `i`'s own run already carries the edit sourced from
    /// source `i - 1`; only the last point writes into the base.
    Serial,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parallel => write!(f, "parallel"),
            Self::Serial => write!(f, "serial"),
        }
    }
}

// ---------------------------------------------------------------------------
// RepresentationKind
// ---------------------------------------------------------------------------

/// Abstract activation kind addressed by an intervention point.
///
/// The concrete module and hook phase for each kind are supplied per model
/// family by [`ModuleMapping`](crate::ModuleMapping).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepresentationKind {
    /// Input of a transformer block (residual stream before the block).
    BlockInput,
    /// Output of a transformer block (residual stream after the block).
    BlockOutput,
    /// MLP hidden activation after the non-linearity.
    MlpActivation,
    /// Output of the MLP sub-block.
    MlpOutput,
    /// Input of the MLP sub-block.
    MlpInput,
    /// Output of the attention sub-block.
    AttentionOutput,
    /// Input of the attention sub-block.
    AttentionInput,
    /// Merged per-head attention values, before the output projection.
    AttentionValueOutput,
    /// Per-head attention values, before the output projection.
    HeadAttentionValueOutput,
    /// Query projection output.
    QueryOutput,
    /// Key projection output.
    KeyOutput,
    /// Value projection output.
    ValueOutput,
    /// Query projection output split into heads.
    HeadQueryOutput,
    /// Key projection output split into heads.
    HeadKeyOutput,
    /// Value projection output split into heads.
    HeadValueOutput,
}

impl RepresentationKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 15] = [
        Self::BlockInput,
        Self::BlockOutput,
        Self::MlpActivation,
        Self::MlpOutput,
        Self::MlpInput,
        Self::AttentionOutput,
        Self::AttentionInput,
        Self::AttentionValueOutput,
        Self::HeadAttentionValueOutput,
        Self::QueryOutput,
        Self::KeyOutput,
        Self::ValueOutput,
        Self::HeadQueryOutput,
        Self::HeadKeyOutput,
        Self::HeadValueOutput,
    ];

    /// The `snake_case` name used in keys and configuration files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BlockInput => "block_input",
            Self::BlockOutput => "block_output",
            Self::MlpActivation => "mlp_activation",
            Self::MlpOutput => "mlp_output",
            Self::MlpInput => "mlp_input",
            Self::AttentionOutput => "attention_output",
            Self::AttentionInput => "attention_input",
            Self::AttentionValueOutput => "attention_value_output",
            Self::HeadAttentionValueOutput => "head_attention_value_output",
            Self::QueryOutput => "query_output",
            Self::KeyOutput => "key_output",
            Self::ValueOutput => "value_output",
            Self::HeadQueryOutput => "head_query_output",
            Self::HeadKeyOutput => "head_key_output",
            Self::HeadValueOutput => "head_value_output",
        }
    }

    /// Whether activations of this kind are laid out per head
    /// (`[batch, heads, seq, head_dim]`).
    #[must_use]
    pub const fn is_per_head(self) -> bool {
        matches!(
            self,
            Self::HeadAttentionValueOutput
                | Self::HeadQueryOutput
                | Self::HeadKeyOutput
                | Self::HeadValueOutput
        )
    }
}

impl fmt::Display for RepresentationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepresentationKind {
    type Err = AlignError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AlignError::Config(format!("unknown representation kind '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// RepresentationDescriptor
// ---------------------------------------------------------------------------

/// One intervention point: where to hook, at what granularity.
///
/// Immutable once registered with an [`AlignableModel`](crate::AlignableModel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepresentationDescriptor {
    /// Layer (block) index.
    pub layer: usize,
    /// Activation kind at that layer.
    pub representation_kind: RepresentationKind,
    /// Dot-separated unit chain, e.g. `"pos"` or `"h.pos"`.
    pub unit: String,
    /// Maximum number of units addressed per example.
    #[serde(default = "default_max_units")]
    pub max_units: usize,
    /// Rank of the learned subspace for low-rank transforms.
    #[serde(default)]
    pub low_rank_dimension: Option<usize>,
    /// Feature-dimension partitions, each a half-open `[start, end)` range.
    /// Subspace requests then name partitions instead of raw features.
    #[serde(default)]
    pub subspace_partition: Option<Vec<(usize, usize)>>,
}

const fn default_max_units() -> usize {
    1
}

impl RepresentationDescriptor {
    /// Create a descriptor with no low-rank dimension and no partition.
    #[must_use]
    pub fn new(
        layer: usize,
        representation_kind: RepresentationKind,
        unit: impl Into<String>,
        max_units: usize,
    ) -> Self {
        Self {
            layer,
            representation_kind,
            unit: unit.into(),
            max_units,
            low_rank_dimension: None,
            subspace_partition: None,
        }
    }

    /// Set the low-rank dimension.
    #[must_use]
    pub fn with_low_rank_dimension(mut self, rank: usize) -> Self {
        self.low_rank_dimension = Some(rank);
        self
    }

    /// Set the subspace partition.
    #[must_use]
    pub fn with_subspace_partition(mut self, partition: Vec<(usize, usize)>) -> Self {
        self.subspace_partition = Some(partition);
        self
    }
}

// ---------------------------------------------------------------------------
// Intervention types
// ---------------------------------------------------------------------------

/// Built-in intervention transform selectable from configuration.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionType {
    /// Copy the source activation over the base.
    Vanilla,
    /// Add the source activation to the base.
    Addition,
    /// Subtract the source activation from the base.
    Subtraction,
    /// Interchange inside a learned full-rank rotation.
    RotatedSpace,
    /// Interchange inside a learned low-rank projection.
    LowRankRotatedSpace,
    /// Interchange inside a learned rotation with a learned soft boundary.
    BoundlessRotatedSpace,
}

impl fmt::Display for InterventionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vanilla => "vanilla",
            Self::Addition => "addition",
            Self::Subtraction => "subtraction",
            Self::RotatedSpace => "rotated_space",
            Self::LowRankRotatedSpace => "low_rank_rotated_space",
            Self::BoundlessRotatedSpace => "boundless_rotated_space",
        };
        f.write_str(name)
    }
}

/// Either one transform type for every point or one per point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InterventionTypes {
    /// Same type at every point.
    Single(InterventionType),
    /// One type per representation, in registration order.
    PerRepresentation(Vec<InterventionType>),
}

impl Default for InterventionTypes {
    fn default() -> Self {
        Self::Single(InterventionType::Vanilla)
    }
}

impl InterventionTypes {
    /// Transform type for the representation at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if a per-representation list is too
    /// short.
    pub fn for_index(&self, index: usize) -> Result<InterventionType> {
        match self {
            Self::Single(ty) => Ok(*ty),
            Self::PerRepresentation(types) => types.get(index).copied().ok_or_else(|| {
                AlignError::Config(format!(
                    "no intervention type for representation {index} ({} given)",
                    types.len()
                ))
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// AlignableConfig
// ---------------------------------------------------------------------------

/// Top-level configuration of an alignable model.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlignableConfig {
    /// Source combination mode.
    #[serde(default)]
    pub mode: Mode,
    /// Intervention points, in registration order.
    pub representations: Vec<RepresentationDescriptor>,
    /// Built-in transform(s) to instantiate.
    #[serde(default)]
    pub intervention_types: InterventionTypes,
}

impl AlignableConfig {
    /// Create a configuration with vanilla interventions everywhere.
    #[must_use]
    pub fn new(mode: Mode, representations: Vec<RepresentationDescriptor>) -> Self {
        Self {
            mode,
            representations,
            intervention_types: InterventionTypes::default(),
        }
    }

    /// Use `ty` at every point.
    #[must_use]
    pub fn with_intervention_type(mut self, ty: InterventionType) -> Self {
        self.intervention_types = InterventionTypes::Single(ty);
        self
    }

    /// Parse a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Json`] on malformed input and
    /// [`AlignError::Config`] if the configuration is inconsistent.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Io`] if the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if there are no representations, a
    /// per-representation type list has the wrong length, or a partition
    /// range is empty.
    pub fn validate(&self) -> Result<()> {
        if self.representations.is_empty() {
            return Err(AlignError::Config("no representations configured".into()));
        }
        if let InterventionTypes::PerRepresentation(types) = &self.intervention_types {
            if types.len() != self.representations.len() {
                return Err(AlignError::Config(format!(
                    "{} intervention types for {} representations",
                    types.len(),
                    self.representations.len()
                )));
            }
        }
        for rep in &self.representations {
            for &(start, end) in rep.subspace_partition.iter().flatten() {
                if start >= end {
                    return Err(AlignError::Config(format!(
                        "empty subspace partition [{start}, {end}) at layer {}",
                        rep.layer
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ModelDims
// ---------------------------------------------------------------------------

/// Model dimensions needed to size intervention points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDims {
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Number of transformer blocks.
    pub num_layers: usize,
    /// Number of query attention heads.
    pub num_attention_heads: usize,
    /// Number of key/value heads (GQA when < `num_attention_heads`).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// MLP intermediate dimension.
    pub intermediate_size: usize,
}

impl ModelDims {
    /// Parse [`ModelDims`] from a `HuggingFace` `config.json` value.
    ///
    /// Dispatches on `model_type`: `gpt2` uses the `n_*` field names,
    /// `llama`, `mistral` and `qwen2` the `LLaMA` names.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if `model_type` is missing or
    /// unsupported, or if required fields are absent.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| AlignError::Config("missing 'model_type' field".into()))?;

        match model_type {
            "gpt2" => Self::parse_gpt2(config),
            "llama" | "mistral" | "qwen2" => Self::parse_llama(config),
            other => Err(AlignError::Config(format!(
                "unsupported model_type: '{other}'"
            ))),
        }
    }

    fn parse_gpt2(config: &Value) -> Result<Self> {
        let hidden_size = get_usize(config, "n_embd")?;
        let num_attention_heads = get_usize(config, "n_head")?;
        Ok(Self {
            hidden_size,
            num_layers: get_usize(config, "n_layer")?,
            num_attention_heads,
            num_kv_heads: num_attention_heads,
            head_dim: get_head_dim(config, hidden_size, num_attention_heads)?,
            // n_inner is null in most GPT-2 configs
            intermediate_size: get_usize_or(config, "n_inner", 4 * hidden_size),
        })
    }

    fn parse_llama(config: &Value) -> Result<Self> {
        let hidden_size = get_usize(config, "hidden_size")?;
        let num_attention_heads = get_usize(config, "num_attention_heads")?;
        Ok(Self {
            hidden_size,
            num_layers: get_usize(config, "num_hidden_layers")?,
            num_attention_heads,
            num_kv_heads: get_usize_or(config, "num_key_value_heads", num_attention_heads),
            head_dim: get_head_dim(config, hidden_size, num_attention_heads)?,
            intermediate_size: get_usize(config, "intermediate_size")?,
        })
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| AlignError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| AlignError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent or null.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract `head_dim`, falling back to `hidden_size / num_attention_heads`.
fn get_head_dim(config: &Value, hidden_size: usize, num_attention_heads: usize) -> Result<usize> {
    let explicit = config.get("head_dim").and_then(Value::as_u64).map(|hd| {
        usize::try_from(hd).map_err(|_| AlignError::Config("head_dim overflows usize".into()))
    });

    match explicit {
        Some(result) => result,
        None if num_attention_heads == 0 => Err(AlignError::Config(
            "num_attention_heads is 0, cannot compute head_dim".into(),
        )),
        None => Ok(hidden_size / num_attention_heads),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
