// SPDX-License-Identifier: MIT OR Apache-2.0

//! Representation-to-module lookup table.
//!
//! For each `(model family, representation kind)` the table records the
//! module path to hook, the hook phase, and how the addressed activation
//! is carved out of the module's primary tensor.  Supporting a new model
//! family means inserting entries here; the orchestration core never
//! names a concrete module.
//!
//! | Family | Block | QKV |
//! |--------|-------|-----|
//! | `gpt2` | `h.{layer}` | fused `attn.c_attn`, sliced by `narrow()` |
//! | `llama` | `layers.{layer}` | separate `self_attn.{q,k,v}_proj`, GQA heads |

use std::collections::HashMap;

use crate::config::{ModelDims, RepresentationDescriptor, RepresentationKind};
use crate::error::{AlignError, Result};
use crate::hooks::HookPhase;

// ---------------------------------------------------------------------------
// Entry rules
// ---------------------------------------------------------------------------

/// Width of a hooked tensor (or of one fused part of it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimRule {
    /// `hidden_size`.
    Hidden,
    /// `intermediate_size`.
    Intermediate,
    /// `num_kv_heads * head_dim`.
    KeyValue,
}

impl DimRule {
    const fn resolve(self, dims: &ModelDims) -> usize {
        match self {
            Self::Hidden => dims.hidden_size,
            Self::Intermediate => dims.intermediate_size,
            Self::KeyValue => dims.num_kv_heads * dims.head_dim,
        }
    }
}

/// Which head count splits a per-head representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadRule {
    /// `num_attention_heads`.
    Attention,
    /// `num_kv_heads`.
    KeyValue,
}

impl HeadRule {
    const fn resolve(self, dims: &ModelDims) -> usize {
        match self {
            Self::Attention => dims.num_attention_heads,
            Self::KeyValue => dims.num_kv_heads,
        }
    }
}

/// How the representation is carved out of the hooked tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentRule {
    /// The whole last dimension.
    Whole {
        /// Width of the tensor.
        width: DimRule,
    },
    /// Part `part` of `parts` equal-width slices of a fused projection.
    Fused {
        /// Zero-based slice index.
        part: usize,
        /// Number of slices in the fused tensor.
        parts: usize,
        /// Width of one slice.
        width: DimRule,
    },
}

/// One row of the lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// Module path with a `{layer}` placeholder, e.g. `h.{layer}.mlp`.
    pub template: String,
    /// Hook on the module's inputs (`Pre`) or outputs (`Post`).
    pub phase: HookPhase,
    /// Carving rule.
    pub component: ComponentRule,
    /// Split the carved tensor into heads.
    pub heads: Option<HeadRule>,
}

impl MappingEntry {
    /// Entry without a head split.
    #[must_use]
    pub fn new(template: &str, phase: HookPhase, component: ComponentRule) -> Self {
        Self {
            template: template.to_owned(),
            phase,
            component,
            heads: None,
        }
    }

    /// Split the carved tensor into heads.
    #[must_use]
    pub fn with_heads(mut self, heads: HeadRule) -> Self {
        self.heads = Some(heads);
        self
    }
}

// ---------------------------------------------------------------------------
// ResolvedTarget
// ---------------------------------------------------------------------------

/// A descriptor bound to a concrete module, resolved once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Concrete module path.
    pub module: String,
    /// Hook phase.
    pub phase: HookPhase,
    /// `(offset, len)` along the last dimension, for fused tensors.
    pub slice: Option<(usize, usize)>,
    /// Head count when the representation is laid out per head.
    pub heads: Option<usize>,
    /// Feature dimension seen by the intervention transform.
    pub feature_dim: usize,
}

// ---------------------------------------------------------------------------
// ModuleMapping
// ---------------------------------------------------------------------------

/// Lookup table keyed by `(family, kind)`.
#[derive(Debug, Clone, Default)]
pub struct ModuleMapping {
    entries: HashMap<(String, RepresentationKind), MappingEntry>,
}

impl ModuleMapping {
    /// Empty table.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table with the built-in `gpt2` and `llama` families.
    #[must_use]
    pub fn builtin() -> Self {
        let mut mapping = Self::empty();
        mapping.add_gpt2();
        mapping.add_llama();
        mapping
    }

    /// Insert or replace one entry.
    pub fn insert(&mut self, family: &str, kind: RepresentationKind, entry: MappingEntry) {
        self.entries.insert((family.to_owned(), kind), entry);
    }

    /// Entry for `(family, kind)`, if any.
    #[must_use]
    pub fn get(&self, family: &str, kind: RepresentationKind) -> Option<&MappingEntry> {
        self.entries.get(&(family.to_owned(), kind))
    }

    /// Bind `descriptor` to a concrete module of a `family` model.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if the pair is not in the table, the
    /// layer is out of range, or the head split does not divide the width.
    pub fn resolve(
        &self,
        family: &str,
        dims: &ModelDims,
        descriptor: &RepresentationDescriptor,
    ) -> Result<ResolvedTarget> {
        let kind = descriptor.representation_kind;
        let entry = self.get(family, kind).ok_or_else(|| {
            AlignError::Config(format!("no module mapping for {kind} in model family '{family}'"))
        })?;
        if descriptor.layer >= dims.num_layers {
            return Err(AlignError::Config(format!(
                "layer {} out of range ({} layers)",
                descriptor.layer, dims.num_layers
            )));
        }

        let (slice, width) = match entry.component {
            ComponentRule::Whole { width } => (None, width.resolve(dims)),
            ComponentRule::Fused { part, parts, width } => {
                if part >= parts {
                    return Err(AlignError::Config(format!(
                        "fused part {part} out of {parts} for {kind}"
                    )));
                }
                let w = width.resolve(dims);
                (Some((part * w, w)), w)
            }
        };

        let heads = entry.heads.map(|rule| rule.resolve(dims));
        let feature_dim = match heads {
            Some(0) => {
                return Err(AlignError::Config(format!("zero heads for {kind}")));
            }
            Some(h) if width % h != 0 => {
                return Err(AlignError::Config(format!(
                    "{kind} width {width} is not divisible by {h} heads"
                )));
            }
            Some(h) => width / h,
            None => width,
        };

        Ok(ResolvedTarget {
            module: entry.template.replace("{layer}", &descriptor.layer.to_string()),
            phase: entry.phase,
            slice,
            heads,
            feature_dim,
        })
    }

    fn add_gpt2(&mut self) {
        use ComponentRule::{Fused, Whole};
        use HookPhase::{Post, Pre};
        use RepresentationKind as K;

        let hidden = Whole {
            width: DimRule::Hidden,
        };
        let qkv = |part| Fused {
            part,
            parts: 3,
            width: DimRule::Hidden,
        };
        let rows = [
            (K::BlockInput, MappingEntry::new("h.{layer}", Pre, hidden)),
            (K::BlockOutput, MappingEntry::new("h.{layer}", Post, hidden)),
            (
                K::MlpActivation,
                MappingEntry::new(
                    "h.{layer}.mlp.act",
                    Post,
                    Whole {
                        width: DimRule::Intermediate,
                    },
                ),
            ),
            (K::MlpOutput, MappingEntry::new("h.{layer}.mlp", Post, hidden)),
            (K::MlpInput, MappingEntry::new("h.{layer}.mlp", Pre, hidden)),
            (
                K::AttentionValueOutput,
                MappingEntry::new("h.{layer}.attn.c_proj", Pre, hidden),
            ),
            (
                K::HeadAttentionValueOutput,
                MappingEntry::new("h.{layer}.attn.c_proj", Pre, hidden)
                    .with_heads(HeadRule::Attention),
            ),
            (K::AttentionOutput, MappingEntry::new("h.{layer}.attn", Post, hidden)),
            (K::AttentionInput, MappingEntry::new("h.{layer}.attn", Pre, hidden)),
            (K::QueryOutput, MappingEntry::new("h.{layer}.attn.c_attn", Post, qkv(0))),
            (K::KeyOutput, MappingEntry::new("h.{layer}.attn.c_attn", Post, qkv(1))),
            (K::ValueOutput, MappingEntry::new("h.{layer}.attn.c_attn", Post, qkv(2))),
            (
                K::HeadQueryOutput,
                MappingEntry::new("h.{layer}.attn.c_attn", Post, qkv(0))
                    .with_heads(HeadRule::Attention),
            ),
            (
                K::HeadKeyOutput,
                MappingEntry::new("h.{layer}.attn.c_attn", Post, qkv(1))
                    .with_heads(HeadRule::Attention),
            ),
            (
                K::HeadValueOutput,
                MappingEntry::new("h.{layer}.attn.c_attn", Post, qkv(2))
                    .with_heads(HeadRule::Attention),
            ),
        ];
        for (kind, entry) in rows {
            self.insert("gpt2", kind, entry);
        }
    }

    fn add_llama(&mut self) {
        use ComponentRule::Whole;
        use HookPhase::{Post, Pre};
        use RepresentationKind as K;

        let hidden = Whole {
            width: DimRule::Hidden,
        };
        let kv = Whole {
            width: DimRule::KeyValue,
        };
        let rows = [
            (K::BlockInput, MappingEntry::new("layers.{layer}", Pre, hidden)),
            (K::BlockOutput, MappingEntry::new("layers.{layer}", Post, hidden)),
            (
                K::MlpActivation,
                MappingEntry::new(
                    "layers.{layer}.mlp.act_fn",
                    Post,
                    Whole {
                        width: DimRule::Intermediate,
                    },
                ),
            ),
            (K::MlpOutput, MappingEntry::new("layers.{layer}.mlp", Post, hidden)),
            (K::MlpInput, MappingEntry::new("layers.{layer}.mlp", Pre, hidden)),
            (
                K::AttentionValueOutput,
                MappingEntry::new("layers.{layer}.self_attn.o_proj", Pre, hidden),
            ),
            (
                K::HeadAttentionValueOutput,
                MappingEntry::new("layers.{layer}.self_attn.o_proj", Pre, hidden)
                    .with_heads(HeadRule::Attention),
            ),
            (
                K::AttentionOutput,
                MappingEntry::new("layers.{layer}.self_attn", Post, hidden),
            ),
            (
                K::AttentionInput,
                MappingEntry::new("layers.{layer}.self_attn", Pre, hidden),
            ),
            (
                K::QueryOutput,
                MappingEntry::new("layers.{layer}.self_attn.q_proj", Post, hidden),
            ),
            (
                K::KeyOutput,
                MappingEntry::new("layers.{layer}.self_attn.k_proj", Post, kv),
            ),
            (
                K::ValueOutput,
                MappingEntry::new("layers.{layer}.self_attn.v_proj", Post, kv),
            ),
            (
                K::HeadQueryOutput,
                MappingEntry::new("layers.{layer}.self_attn.q_proj", Post, hidden)
                    .with_heads(HeadRule::Attention),
            ),
            (
                K::HeadKeyOutput,
                MappingEntry::new("layers.{layer}.self_attn.k_proj", Post, kv)
                    .with_heads(HeadRule::KeyValue),
            ),
            (
                K::HeadValueOutput,
                MappingEntry::new("layers.{layer}.self_attn.v_proj", Post, kv)
                    .with_heads(HeadRule::KeyValue),
            ),
        ];
        for (kind, entry) in rows {
            self.insert("llama", kind, entry);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
