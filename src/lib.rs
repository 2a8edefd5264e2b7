// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-align
//!
//! Causal-abstraction interventions on [candle](https://github.com/huggingface/candle)
//! models.
//!
//! An [`AlignableModel`] instruments a model at configured intervention
//! points (layer, representation kind, unit granularity), captures
//! activations from one or more *source* inputs and swaps them into the
//! computation of a *base* input.  Comparing the counterfactual output with
//! the baseline tests whether a hypothesised causal variable lives at that
//! location.
//!
//! ## Pieces
//!
//! - [`AlignableBackend`]: the model boundary.  A backend announces each
//!   named module call through [`ModuleHooks`]; nothing else about the
//!   model is assumed.
//! - [`ModuleMapping`]: per-family table from representation kinds to
//!   module paths and sub-component slices (`gpt2`, `llama`).
//! - [`Intervention`]: pluggable edits, fixed (interchange, addition,
//!   subtraction) or trainable (rotated-space variants).
//! - [`AlignableModel::find_alignment`]: trains the rotated-space
//!   transforms against counterfactual labels.
//!
//! ## Example
//!
//! ```no_run
//! use candle_align::{
//!     AlignableBackend, AlignableConfig, AlignableModel, InterventionRequest, Mode,
//!     ModelInputs, RepresentationDescriptor, RepresentationKind, UnitLocation, UnitLocations,
//! };
//!
//! fn swap_position<B: AlignableBackend>(
//!     backend: B,
//!     base: &ModelInputs,
//!     source: ModelInputs,
//! ) -> candle_align::Result<()> {
//!     let config = AlignableConfig::new(
//!         Mode::Parallel,
//!         vec![RepresentationDescriptor::new(3, RepresentationKind::BlockOutput, "pos", 1)],
//!     );
//!     let mut model = AlignableModel::new(&config, backend)?;
//!     let request = InterventionRequest::new()
//!         .with_sources(vec![source])
//!         .with_unit_locations(UnitLocations::parallel(
//!             vec![UnitLocation::single(vec![vec![0], vec![0]])],
//!             vec![UnitLocation::single(vec![vec![2], vec![3]])],
//!         ));
//!     let (_base, counterfactual) = model.forward(base, &request)?;
//!     assert!(counterfactual.is_some());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod alignable;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod hooks;
pub mod interp;
pub mod keys;
pub mod locations;
pub mod mapping;
pub mod ordering;
pub mod subcomponent;
pub mod train;
pub mod units;

// --- Orchestrator ------------------------------------------------------
pub use alignable::{AlignableModel, InterventionPoint, InterventionRequest};

// --- Model boundary ----------------------------------------------------
pub use backend::{
    AlignableBackend, GenerationOptions, ModelInputs, ModelOutput, next_tokens, sample_token,
};
pub use hooks::{HookArgs, HookPhase, ModuleHooks, NoHooks, hook_input, hook_output};

// --- Configuration -----------------------------------------------------
pub use config::{
    AlignableConfig, InterventionType, InterventionTypes, Mode, ModelDims,
    RepresentationDescriptor, RepresentationKind,
};
pub use mapping::{ComponentRule, DimRule, HeadRule, MappingEntry, ModuleMapping, ResolvedTarget};

// --- Addressing --------------------------------------------------------
pub use keys::{InterventionKey, KeyRegistry};
pub use locations::{BatchIndices, LocationPair, SOURCES_TO_BASE, UnitLocation, UnitLocations};
pub use units::UnitSpec;

// --- Per-call state ----------------------------------------------------
pub use cache::{ActivationCache, CallCounters, HookSide};

// --- Interventions -----------------------------------------------------
pub use interp::{
    AdditionIntervention, BoundlessRotatedSpaceIntervention, FeatureSubspace, Intervention,
    LowRankRotatedSpaceIntervention, RotatedSpaceIntervention, Subspace, SubtractionIntervention,
    Trainable, VanillaIntervention, build_intervention,
};

// --- Training ----------------------------------------------------------
pub use train::{
    AlignmentBatch, Collator, LinearWarmupSchedule, TrainingArgs, TrainingReport,
    last_position_accuracy, last_position_cross_entropy, weighted_average,
};

// --- Errors ------------------------------------------------------------
pub use error::{AlignError, Result};
