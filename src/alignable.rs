// SPDX-License-Identifier: MIT OR Apache-2.0

//! The alignable model: intervention orchestration over a backend.
//!
//! [`AlignableModel`] owns the intervention points of one configuration,
//! sorted by the order in which their hooks fire, and implements
//! counterfactual `forward` and `generate`:
//!
//! 1. clear the per-call cache, counters and any stray hooks;
//! 2. run the base input without hooks (the returned baseline);
//! 3. capture each point's source slice with a getter hook;
//! 4. attach setter hooks and re-run the base input, letting every setter
//!    replace its slice of the live activation.
//!
//! In [`Mode::Parallel`] all sources are captured independently and every
//! setter fires during a single base run.  In [`Mode::Serial`] point `i`'s
//! setter stays attached while source `i + 1` is captured, so each
//! source's computation already carries the previous edit.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use candle_core::{Tensor, Var};
use tracing::{debug, warn};

use crate::backend::{AlignableBackend, GenerationOptions, ModelInputs, ModelOutput};
use crate::cache::{ActivationCache, CallCounters, HookSide};
use crate::config::{AlignableConfig, Mode, RepresentationDescriptor};
use crate::error::{AlignError, Result};
use crate::hooks::{
    HandlerList, HookArgs, HookBinding, HookPhase, HookRegistry, ModuleHooks, NoHooks,
};
use crate::interp::{FeatureSubspace, Intervention, Subspace, build_intervention};
use crate::keys::{InterventionKey, KeyRegistry};
use crate::locations::{BatchIndices, LocationPair, SOURCES_TO_BASE, UnitLocation, UnitLocations};
use crate::mapping::{ModuleMapping, ResolvedTarget};
use crate::ordering::execution_order;
use crate::subcomponent::{extract, inject};
use crate::units::{UnitSpec, gather, scatter};

// ---------------------------------------------------------------------------
// InterventionPoint
// ---------------------------------------------------------------------------

/// One instrumented location and the transform applied there.
#[derive(Debug)]
pub struct InterventionPoint {
    key: InterventionKey,
    descriptor: RepresentationDescriptor,
    target: ResolvedTarget,
    unit: UnitSpec,
    // TRAIT_OBJECT: transforms are chosen per point at runtime
    intervention: Box<dyn Intervention>,
}

impl InterventionPoint {
    /// Unique key.
    #[must_use]
    pub const fn key(&self) -> &InterventionKey {
        &self.key
    }

    /// Configuration the point was built from.
    #[must_use]
    pub const fn descriptor(&self) -> &RepresentationDescriptor {
        &self.descriptor
    }

    /// Module, phase and sub-component the point is bound to.
    #[must_use]
    pub const fn target(&self) -> &ResolvedTarget {
        &self.target
    }

    /// Unit granularity.
    #[must_use]
    pub const fn unit(&self) -> UnitSpec {
        self.unit
    }

    /// Transform applied by the setter.
    #[must_use]
    pub fn intervention(&self) -> &dyn Intervention {
        self.intervention.as_ref()
    }
}

// ---------------------------------------------------------------------------
// InterventionRequest
// ---------------------------------------------------------------------------

/// Counterfactual inputs of one `forward`/`generate` call.
///
/// Lists are indexed like [`AlignableModel::points`], i.e. in execution
/// order.  A request with neither sources nor precomputed activations
/// makes the call a plain pass-through.
///
/// ```
/// use candle_align::{InterventionRequest, UnitLocation, UnitLocations};
///
/// let locations = UnitLocations::parallel(
///     vec![UnitLocation::single(vec![vec![0], vec![0]])],
///     vec![UnitLocation::single(vec![vec![2], vec![3]])],
/// );
/// let request = InterventionRequest::new().with_unit_locations(locations);
/// assert!(request.is_pass_through());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InterventionRequest {
    sources: Option<Vec<ModelInputs>>,
    unit_locations: Option<UnitLocations>,
    activations_sources: Option<HashMap<InterventionKey, Tensor>>,
    subspaces: Option<Vec<Subspace>>,
}

impl InterventionRequest {
    /// Empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One source input per intervention point.
    #[must_use]
    pub fn with_sources(mut self, sources: Vec<ModelInputs>) -> Self {
        self.sources = Some(sources);
        self
    }

    /// Where to gather and where to write.
    #[must_use]
    pub fn with_unit_locations(mut self, locations: UnitLocations) -> Self {
        self.unit_locations = Some(locations);
        self
    }

    /// Precomputed source slices, keyed by intervention point.  When given,
    /// no source run happens.
    #[must_use]
    pub fn with_activations_sources(mut self, activations: HashMap<InterventionKey, Tensor>) -> Self {
        self.activations_sources = Some(activations);
        self
    }

    /// One subspace per intervention point.
    #[must_use]
    pub fn with_subspaces(mut self, subspaces: Vec<Subspace>) -> Self {
        self.subspaces = Some(subspaces);
        self
    }

    /// Whether the call reduces to an uninstrumented model call.
    #[must_use]
    pub const fn is_pass_through(&self) -> bool {
        self.sources.is_none() && self.activations_sources.is_none()
    }
}

// ---------------------------------------------------------------------------
// Per-call state and hook session
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CallState {
    cache: ActivationCache,
    counters: CallCounters,
    /// `Some(intervene_on_prompt)` while the backend is generating.
    generation: Option<bool>,
}

/// Dispatches backend hook events to the attached bindings.
struct HookSession<'a> {
    points: &'a [InterventionPoint],
    registry: &'a HookRegistry,
    state: &'a mut CallState,
    external: Option<&'a HashMap<InterventionKey, Tensor>>,
}

fn lookup(points: &[InterventionPoint], index: usize) -> Result<&InterventionPoint> {
    points
        .get(index)
        .ok_or_else(|| AlignError::State(format!("hook bound to unknown point {index}")))
}

impl HookSession<'_> {
    fn get(&mut self, index: usize, location: &UnitLocation, args: &mut HookArgs<'_>) -> Result<()> {
        let point = lookup(self.points, index)?;
        if !self
            .state
            .counters
            .tick(HookSide::Getter, &point.key, self.state.generation)
        {
            return Ok(());
        }
        let raw = args.primary_mut()?;
        let part = extract(raw, &point.target)?;
        let slice = gather(&part, point.unit, location)?;
        self.state.cache.store(point.key.clone(), slice);
        Ok(())
    }

    fn set(
        &mut self,
        index: usize,
        location: &UnitLocation,
        subspace: Option<&FeatureSubspace>,
        args: &mut HookArgs<'_>,
    ) -> Result<()> {
        let point = lookup(self.points, index)?;
        let key = &point.key;
        if !self
            .state
            .counters
            .tick(HookSide::Setter, key, self.state.generation)
        {
            return Ok(());
        }
        let source = self
            .state
            .cache
            .get(key)
            .or_else(|| self.external.and_then(|m| m.get(key)))
            .cloned()
            .ok_or_else(|| {
                AlignError::State(format!("setter for '{key}' fired with no captured source"))
            })?;

        let raw = args.primary_mut()?;
        let part = extract(raw, &point.target)?;
        let base = gather(&part, point.unit, location)?;
        let edited = point.intervention.intervene(&base, &source, subspace)?;
        let part = scatter(&part, &edited, point.unit, location)?;
        *raw = inject(raw, &part, &point.target)?;
        Ok(())
    }
}

impl ModuleHooks for HookSession<'_> {
    fn fire(&mut self, module: &str, phase: HookPhase, mut args: HookArgs<'_>) -> Result<()> {
        for binding in self.registry.bindings_for(module, phase) {
            match binding.as_ref() {
                HookBinding::Getter { point, location } => self.get(*point, location, &mut args)?,
                HookBinding::Setter {
                    point,
                    location,
                    subspace,
                } => self.set(*point, location, subspace.as_ref(), &mut args)?,
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AlignableModel
// ---------------------------------------------------------------------------

/// A backend instrumented with intervention points.
///
/// Hooks never outlive a call: every registration is scoped, and the
/// registry is cleared again at the start of the next call.
pub struct AlignableModel<B: AlignableBackend> {
    backend: B,
    mode: Mode,
    /// Points in execution order.
    points: Vec<InterventionPoint>,
    /// Keys in configuration order.
    registration_order: Vec<InterventionKey>,
    registry: HookRegistry,
    state: CallState,
}

impl<B: AlignableBackend> AlignableModel<B> {
    // --- Construction ----------------------------------------------------

    /// Instrument `backend` with the built-in module mapping and the
    /// configured transform types.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if the configuration is invalid, a
    /// representation cannot be mapped onto the backend, or a target
    /// module is missing from the backend's module structure.
    pub fn new(config: &AlignableConfig, backend: B) -> Result<Self> {
        Self::with_mapping(config, backend, &ModuleMapping::builtin())
    }

    /// Like [`new`](Self::new) with a caller-supplied module mapping.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_mapping(config: &AlignableConfig, backend: B, mapping: &ModuleMapping) -> Result<Self> {
        config.validate()?;
        let targets = resolve_targets(config, &backend, mapping)?;
        let interventions = config
            .representations
            .iter()
            .zip(&targets)
            .enumerate()
            .map(|(i, (descriptor, target))| {
                build_intervention(
                    config.intervention_types.for_index(i)?,
                    target.feature_dim,
                    descriptor,
                    backend.device(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(config, backend, targets, interventions)
    }

    /// Instrument `backend` with caller-built transforms, one per
    /// representation in configuration order.  `config.intervention_types`
    /// is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if the transform count differs from
    /// the representation count, or as [`new`](Self::new).
    pub fn with_interventions(
        config: &AlignableConfig,
        backend: B,
        mapping: &ModuleMapping,
        interventions: Vec<Box<dyn Intervention>>,
    ) -> Result<Self> {
        config.validate()?;
        if interventions.len() != config.representations.len() {
            return Err(AlignError::Config(format!(
                "{} interventions for {} representations",
                interventions.len(),
                config.representations.len()
            )));
        }
        let targets = resolve_targets(config, &backend, mapping)?;
        Self::assemble(config, backend, targets, interventions)
    }

    fn assemble(
        config: &AlignableConfig,
        backend: B,
        targets: Vec<ResolvedTarget>,
        interventions: Vec<Box<dyn Intervention>>,
    ) -> Result<Self> {
        let mut keys = KeyRegistry::new();
        let mut points = Vec::with_capacity(targets.len());
        for ((descriptor, target), intervention) in
            config.representations.iter().zip(targets).zip(interventions)
        {
            let unit = UnitSpec::from_str(&descriptor.unit)?;
            if unit.needs_heads() && target.heads.is_none() {
                return Err(AlignError::Config(format!(
                    "unit '{unit}' needs a per-head representation, got {}",
                    descriptor.representation_kind
                )));
            }
            points.push(InterventionPoint {
                key: keys.register(descriptor),
                descriptor: descriptor.clone(),
                target,
                unit,
                intervention,
            });
        }
        let registration_order: Vec<InterventionKey> =
            points.iter().map(|p| p.key.clone()).collect();

        let hooked: Vec<(&str, HookPhase)> = points
            .iter()
            .map(|p| (p.target.module.as_str(), p.target.phase))
            .collect();
        let order = execution_order(&backend.module_paths(), &hooked)?;
        let mut slots: Vec<Option<InterventionPoint>> = points.into_iter().map(Some).collect();
        let points: Vec<InterventionPoint> = order
            .into_iter()
            .filter_map(|i| slots.get_mut(i).and_then(Option::take))
            .collect();

        debug!(
            family = backend.family(),
            mode = %config.mode,
            points = points.len(),
            "alignable model ready"
        );
        Ok(Self {
            backend,
            mode: config.mode,
            points,
            registration_order,
            registry: HookRegistry::default(),
            state: CallState::default(),
        })
    }

    // --- Accessors -------------------------------------------------------

    /// The wrapped backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Source combination mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Intervention points in execution order.
    #[must_use]
    pub fn points(&self) -> &[InterventionPoint] {
        &self.points
    }

    /// Point registered under `key`.
    #[must_use]
    pub fn point(&self, key: &InterventionKey) -> Option<&InterventionPoint> {
        self.points.iter().find(|p| &p.key == key)
    }

    /// Keys in execution order.
    #[must_use]
    pub fn sorted_keys(&self) -> Vec<&InterventionKey> {
        self.points.iter().map(|p| &p.key).collect()
    }

    /// Keys in configuration order.
    #[must_use]
    pub fn keys(&self) -> &[InterventionKey] {
        &self.registration_order
    }

    /// Unit specs in execution order.
    #[must_use]
    pub fn units(&self) -> Vec<UnitSpec> {
        self.points.iter().map(|p| p.unit).collect()
    }

    /// Source slices captured by the most recent call.
    #[must_use]
    pub const fn cached_activations(&self) -> &ActivationCache {
        &self.state.cache
    }

    /// Rebuild nested unit locations from a flat batch map such as
    /// `{"source_0->base.1.pos": [[2], [3]]}`.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Location`] if a key needed by a point's unit
    /// spec is absent.
    pub fn unit_locations_from_flat(
        &self,
        flat: &std::collections::BTreeMap<String, BatchIndices>,
    ) -> Result<UnitLocations> {
        UnitLocations::from_flat(flat, &self.units(), self.mode)
    }

    // --- Trainable capability --------------------------------------------

    /// Parameters of every unfrozen trainable transform.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.points
            .iter()
            .filter_map(|p| p.intervention.trainable())
            .flat_map(|t| t.vars())
            .collect()
    }

    /// Scalar parameter count over all trainable transforms.
    #[must_use]
    pub fn count_parameters(&self) -> usize {
        self.points
            .iter()
            .filter_map(|p| p.intervention.trainable())
            .map(|t| t.num_parameters())
            .sum()
    }

    /// Forward an annealing temperature to every trainable transform.
    pub fn set_temperature(&mut self, temperature: f64) {
        for point in &mut self.points {
            if let Some(t) = point.intervention.trainable_mut() {
                t.set_temperature(temperature);
            }
        }
    }

    /// Drop accumulated gradients of every trainable transform.
    pub fn set_zero_grad(&mut self) {
        for point in &mut self.points {
            if let Some(t) = point.intervention.trainable_mut() {
                t.zero_grad();
            }
        }
    }

    /// Project every unfrozen transform's parameters back onto their
    /// constraint set; called after each optimiser update.
    ///
    /// # Errors
    ///
    /// Propagates the first transform's projection error.
    pub fn restore_constraints(&mut self) -> Result<()> {
        for point in &mut self.points {
            if let Some(t) = point.intervention.trainable_mut() {
                if !t.is_frozen() {
                    t.restore_constraints()?;
                }
            }
        }
        Ok(())
    }

    /// Freeze every trainable transform.
    pub fn disable_intervention_gradients(&mut self) {
        self.set_frozen(true);
    }

    /// Unfreeze every trainable transform.
    pub fn enable_intervention_gradients(&mut self) {
        self.set_frozen(false);
    }

    fn set_frozen(&mut self, frozen: bool) {
        for point in &mut self.points {
            if let Some(t) = point.intervention.trainable_mut() {
                t.set_frozen(frozen);
            }
        }
    }

    // --- Counterfactual calls --------------------------------------------

    /// Run `base`, then run it again with every point's source slice
    /// swapped in.
    ///
    /// Returns `(base_outputs, counterfactual_outputs)`.  The baseline is
    /// detached from the autograd graph; the counterfactual is not, so a
    /// loss on it reaches trainable transform parameters.  A pass-through
    /// request returns `(outputs, None)`.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] on count mismatches or missing
    /// location groups, [`AlignError::Location`] on bad indices,
    /// [`AlignError::State`] if a setter finds no source slice, and
    /// propagates backend and transform errors.  No hook survives an error.
    pub fn forward(
        &mut self,
        base: &ModelInputs,
        request: &InterventionRequest,
    ) -> Result<(ModelOutput, Option<ModelOutput>)> {
        self.cleanup();
        if request.is_pass_through() {
            return Ok((self.backend.forward(base, &mut NoHooks)?, None));
        }
        let locations = self.checked_locations(request)?;
        let base_outputs = self.backend.forward(base, &mut NoHooks)?.detach();
        let counterfactual = self.intervene(request, &locations, None, |backend, hooks| {
            backend.forward(base, hooks)
        })?;
        Ok((base_outputs, Some(counterfactual)))
    }

    /// Generation counterpart of [`forward`](Self::forward).
    ///
    /// Sources are captured with plain forward passes; setters are gated
    /// per decode step during the counterfactual generation: with
    /// `intervene_on_prompt` they act on the prompt pass only, without it
    /// they skip the prompt pass and act on every later step.  Only
    /// `intervene_on_prompt = true` is a supported configuration.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - returns: two `[batch, seq + generated]` token tensors
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward).
    pub fn generate(
        &mut self,
        input_ids: &Tensor,
        request: &InterventionRequest,
        intervene_on_prompt: bool,
        options: &GenerationOptions,
    ) -> Result<(Tensor, Option<Tensor>)> {
        self.cleanup();
        if request.is_pass_through() {
            return Ok((self.backend.generate(input_ids, options, &mut NoHooks)?, None));
        }
        warn!("interventions during generation are only validated on the prompt");
        if !intervene_on_prompt {
            warn!("intervene_on_prompt = false: edits apply at every decode step, unverified");
        }
        let locations = self.checked_locations(request)?;
        let base_outputs = self
            .backend
            .generate(input_ids, options, &mut NoHooks)?
            .detach();
        let counterfactual =
            self.intervene(request, &locations, Some(intervene_on_prompt), |backend, hooks| {
                backend.generate(input_ids, options, hooks)
            })?;
        Ok((base_outputs, Some(counterfactual)))
    }

    fn cleanup(&mut self) {
        self.state.cache.clear();
        self.state.counters.reset();
        self.state.generation = None;
        let stray = self.registry.clear();
        if stray > 0 {
            warn!(stray, "removed hooks left over from a previous call");
        }
    }

    /// Validate the request and return the locations to use.
    fn checked_locations(&self, request: &InterventionRequest) -> Result<UnitLocations> {
        let n = self.points.len();
        if let Some(sources) = &request.sources {
            if sources.len() != n {
                return Err(AlignError::Config(format!(
                    "{} sources for {n} intervention points",
                    sources.len()
                )));
            }
        }
        if let Some(activations) = &request.activations_sources {
            if let Some(missing) = self.points.iter().find(|p| !activations.contains_key(&p.key)) {
                return Err(AlignError::Config(format!(
                    "precomputed activations lack '{}'",
                    missing.key
                )));
            }
        }
        if let Some(subspaces) = &request.subspaces {
            if subspaces.len() != n {
                return Err(AlignError::Config(format!(
                    "{} subspaces for {n} intervention points",
                    subspaces.len()
                )));
            }
        }

        let locations = match &request.unit_locations {
            Some(locations) => locations.clone(),
            None => self.whole_sequence_locations()?,
        };
        match self.mode {
            Mode::Parallel => {
                let pair = locations.require(SOURCES_TO_BASE)?;
                if pair.sources.len() != n || pair.base.len() != n {
                    return Err(AlignError::Config(format!(
                        "'{SOURCES_TO_BASE}' holds {} source and {} base locations for {n} points",
                        pair.sources.len(),
                        pair.base.len()
                    )));
                }
            }
            Mode::Serial => {
                if locations.contains(SOURCES_TO_BASE) {
                    return Err(AlignError::Config(format!(
                        "'{SOURCES_TO_BASE}' is not allowed in serial mode"
                    )));
                }
                for i in 0..n {
                    serial_pair(&locations, i, n)?;
                }
            }
        }
        Ok(locations)
    }

    /// Locations for a request that gives none; only whole-sequence units
    /// can do without.
    fn whole_sequence_locations(&self) -> Result<UnitLocations> {
        if let Some(point) = self.points.iter().find(|p| p.unit != UnitSpec::Sequence) {
            return Err(AlignError::Config(format!(
                "unit locations are required for '{}'",
                point.key
            )));
        }
        let n = self.points.len();
        let empty = || vec![UnitLocation::default(); n];
        Ok(match self.mode {
            Mode::Parallel => UnitLocations::parallel(empty(), empty()),
            Mode::Serial => (0..n).fold(UnitLocations::new(), |acc, i| {
                acc.with(
                    UnitLocations::serial_key(i, n),
                    LocationPair::single(UnitLocation::default(), UnitLocation::default()),
                )
            }),
        })
    }

    /// Capture sources, attach setters and run `final_run` on the base.
    fn intervene<T>(
        &mut self,
        request: &InterventionRequest,
        locations: &UnitLocations,
        generation: Option<bool>,
        final_run: impl FnOnce(&B, &mut dyn ModuleHooks) -> Result<T>,
    ) -> Result<T> {
        let Self {
            backend,
            mode,
            points,
            registry,
            state,
            ..
        } = self;
        let backend = &*backend;
        let points = points.as_slice();
        let registry = &*registry;
        let external = request.activations_sources.as_ref();
        let sources = request.sources.as_deref().unwrap_or_default();

        let subspaces = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                request
                    .subspaces
                    .as_ref()
                    .and_then(|s| s.get(i))
                    .map(|s| s.resolve(p.descriptor.subspace_partition.as_deref()))
                    .transpose()
            })
            .collect::<Result<Vec<_>>>()?;

        let capture = |i: usize, location: &UnitLocation, state: &mut CallState| -> Result<()> {
            let (Some(point), Some(source)) = (points.get(i), sources.get(i)) else {
                return Err(AlignError::Config(format!("no source input for point {i}")));
            };
            let getter = registry.register(
                point.target.module.as_str(),
                point.target.phase,
                HookBinding::Getter {
                    point: i,
                    location: location.clone(),
                },
            );
            let mut session = HookSession {
                points,
                registry,
                state,
                external,
            };
            backend.forward(source, &mut session)?;
            getter.remove();
            Ok(())
        };
        let setter = |i: usize, point: &InterventionPoint, location: &UnitLocation| {
            registry.register(
                point.target.module.as_str(),
                point.target.phase,
                HookBinding::Setter {
                    point: i,
                    location: location.clone(),
                    subspace: subspaces.get(i).cloned().flatten(),
                },
            )
        };

        let mut setters = HandlerList::new();
        match mode {
            Mode::Parallel => {
                let pair = locations.require(SOURCES_TO_BASE)?;
                if external.is_none() {
                    for (i, location) in pair.sources.iter().enumerate() {
                        capture(i, location, &mut *state)?;
                    }
                }
                for (i, (point, location)) in points.iter().zip(&pair.base).enumerate() {
                    setters.push(setter(i, point, location));
                }
            }
            Mode::Serial => {
                let n = points.len();
                for (i, point) in points.iter().enumerate() {
                    let (source_location, base_location) = serial_pair(locations, i, n)?;
                    if external.is_none() {
                        // the previous point's setter is still attached here
                        capture(i, source_location, &mut *state)?;
                    }
                    setters.remove();
                    setters.push(setter(i, point, base_location));
                }
            }
        }
        debug!(setters = setters.len(), "running counterfactual");

        state.generation = generation;
        let mut session = HookSession {
            points,
            registry,
            state: &mut *state,
            external,
        };
        let outcome = final_run(backend, &mut session);
        state.generation = None;
        setters.remove();
        outcome
    }
}

impl<B: AlignableBackend> fmt::Display for AlignableModel<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let points: Vec<serde_json::Value> = self
            .points
            .iter()
            .map(|p| {
                serde_json::json!({
                    "key": p.key.as_str(),
                    "module": p.target.module,
                    "phase": p.target.phase.to_string(),
                    "unit": p.unit.to_string(),
                    "feature_dim": p.target.feature_dim,
                    "intervention": p.intervention.name(),
                })
            })
            .collect();
        let summary = serde_json::json!({
            "model_family": self.backend.family(),
            "mode": self.mode.to_string(),
            "intervention_points": points,
        });
        let text = serde_json::to_string_pretty(&summary).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn resolve_targets<B: AlignableBackend>(
    config: &AlignableConfig,
    backend: &B,
    mapping: &ModuleMapping,
) -> Result<Vec<ResolvedTarget>> {
    config
        .representations
        .iter()
        .map(|d| mapping.resolve(backend.family(), backend.dims(), d))
        .collect()
}

/// Source-side and base-side location of serial step `i` out of `n`.
fn serial_pair(locations: &UnitLocations, i: usize, n: usize) -> Result<(&UnitLocation, &UnitLocation)> {
    let key = UnitLocations::serial_key(i, n);
    let pair = locations.require(&key)?;
    match (pair.sources.first(), pair.base.first()) {
        (Some(source), Some(base)) => Ok((source, base)),
        _ => Err(AlignError::Config(format!("location group '{key}' is empty"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
