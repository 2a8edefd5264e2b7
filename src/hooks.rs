// SPDX-License-Identifier: MIT OR Apache-2.0

//! Module hook surface and the scoped hook registry.
//!
//! A backend announces every named module call through
//! [`ModuleHooks::fire`], once before the module runs
//! ([`HookPhase::Pre`], carrying its inputs) and once after
//! ([`HookPhase::Post`], carrying its outputs).  The callee may replace
//! any of the tensors in place; the backend continues with whatever is
//! left in the slots.
//!
//! Inside the crate, `HookRegistry` records which getter and setter
//! bindings are attached to which `(module, phase)`.  Every registration
//! returns a `HookHandle` that detaches its binding when dropped, so a
//! call that fails halfway cannot leave hooks behind.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use candle_core::Tensor;

use crate::error::{AlignError, Result};
use crate::interp::FeatureSubspace;
use crate::locations::UnitLocation;

// ---------------------------------------------------------------------------
// HookPhase / HookArgs
// ---------------------------------------------------------------------------

/// Which side of a module call a hook sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPhase {
    /// Before the module runs; the hook sees the module inputs.
    Pre,
    /// After the module runs; the hook sees the module outputs.
    Post,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pre => write!(f, "pre"),
            Self::Post => write!(f, "post"),
        }
    }
}

/// Mutable view of the tensors crossing a module boundary.
#[derive(Debug)]
pub enum HookArgs<'a> {
    /// Module inputs: positional arguments and keyword arguments.
    Inputs {
        /// Positional arguments.
        args: &'a mut [Tensor],
        /// Keyword arguments, in call order.
        kwargs: &'a mut [(String, Tensor)],
    },
    /// Module outputs; element 0 is the primary output.
    Outputs(&'a mut [Tensor]),
}

impl HookArgs<'_> {
    /// The tensor an intervention reads and rewrites.
    ///
    /// For outputs this is the first element.  For inputs it is the first
    /// positional argument, or the first keyword argument when the module
    /// was called with keywords only.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Hook`] if the call carries no tensor.
    pub fn primary_mut(&mut self) -> Result<&mut Tensor> {
        let found = match self {
            Self::Outputs(outputs) => outputs.first_mut(),
            Self::Inputs { args, kwargs } => match args.first_mut() {
                Some(arg) => Some(arg),
                None => kwargs.first_mut().map(|(_, t)| t),
            },
        };
        found.ok_or_else(|| AlignError::Hook("hooked module call carries no tensor".into()))
    }
}

// ---------------------------------------------------------------------------
// ModuleHooks
// ---------------------------------------------------------------------------

/// Receiver for module-boundary events raised by a backend.
pub trait ModuleHooks {
    /// Called at `phase` of the module named `module`.
    ///
    /// # Errors
    ///
    /// Implementations return an error to abort the backend call.
    fn fire(&mut self, module: &str, phase: HookPhase, args: HookArgs<'_>) -> Result<()>;
}

/// Hooks that observe nothing; a plain forward pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ModuleHooks for NoHooks {
    fn fire(&mut self, _module: &str, _phase: HookPhase, _args: HookArgs<'_>) -> Result<()> {
        Ok(())
    }
}

/// Raise a [`HookPhase::Post`] event for a single-output module and
/// return the (possibly replaced) output.
///
/// # Errors
///
/// Propagates errors from the hook receiver.
pub fn hook_output(hooks: &mut dyn ModuleHooks, module: &str, output: Tensor) -> Result<Tensor> {
    let mut outputs = [output];
    hooks.fire(module, HookPhase::Post, HookArgs::Outputs(&mut outputs))?;
    let [output] = outputs;
    Ok(output)
}

/// Raise a [`HookPhase::Pre`] event for a single-input module and return
/// the (possibly replaced) input.
///
/// # Errors
///
/// Propagates errors from the hook receiver.
pub fn hook_input(hooks: &mut dyn ModuleHooks, module: &str, input: Tensor) -> Result<Tensor> {
    let mut args = [input];
    hooks.fire(
        module,
        HookPhase::Pre,
        HookArgs::Inputs {
            args: &mut args,
            kwargs: &mut [],
        },
    )?;
    let [input] = args;
    Ok(input)
}

// ---------------------------------------------------------------------------
// Bindings and registry
// ---------------------------------------------------------------------------

/// What an attached hook does when its module fires.
#[derive(Debug)]
pub(crate) enum HookBinding {
    /// Gather the point's activation and store it in the call cache.
    Getter {
        /// Index of the intervention point in the model's point list.
        point: usize,
        /// Units to gather.
        location: UnitLocation,
    },
    /// Rewrite the point's activation from the cached source slice.
    Setter {
        /// Index of the intervention point in the model's point list.
        point: usize,
        /// Units of the live activation to rewrite.
        location: UnitLocation,
        /// Feature coordinates the transform may touch.
        subspace: Option<FeatureSubspace>,
    },
}

#[derive(Debug)]
struct RegisteredHook {
    id: u64,
    module: String,
    phase: HookPhase,
    binding: Rc<HookBinding>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: u64,
    hooks: Vec<RegisteredHook>,
}

/// Attached getter/setter bindings, keyed by module and phase.
#[derive(Debug, Default)]
pub(crate) struct HookRegistry {
    inner: RefCell<RegistryInner>,
}

impl HookRegistry {
    /// Attach `binding` at `(module, phase)`.
    ///
    /// The binding stays attached until the returned handle is dropped.
    pub(crate) fn register(
        &self,
        module: impl Into<String>,
        phase: HookPhase,
        binding: HookBinding,
    ) -> HookHandle<'_> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        let module = module.into();
        tracing::debug!(module = %module, %phase, id, "hook attached");
        inner.hooks.push(RegisteredHook {
            id,
            module,
            phase,
            binding: Rc::new(binding),
        });
        HookHandle { registry: self, id }
    }

    /// Bindings attached at `(module, phase)`, in attachment order.
    pub(crate) fn bindings_for(&self, module: &str, phase: HookPhase) -> Vec<Rc<HookBinding>> {
        self.inner
            .borrow()
            .hooks
            .iter()
            .filter(|h| h.phase == phase && h.module == module)
            .map(|h| Rc::clone(&h.binding))
            .collect()
    }

    /// Number of attached bindings.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.borrow().hooks.len()
    }

    /// Whether no binding is attached.
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach everything; returns how many bindings were stray.
    pub(crate) fn clear(&self) -> usize {
        let mut inner = self.inner.borrow_mut();
        let stray = inner.hooks.len();
        inner.hooks.clear();
        stray
    }

    fn remove(&self, id: u64) {
        // A failed borrow means a clear() is in progress; that removes us too.
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            inner.hooks.retain(|h| h.id != id);
            tracing::debug!(id, "hook detached");
        }
    }
}

/// Scoped registration: detaches its binding on drop.
#[derive(Debug)]
#[must_use = "dropping a HookHandle detaches the hook immediately"]
pub(crate) struct HookHandle<'r> {
    registry: &'r HookRegistry,
    id: u64,
}

impl HookHandle<'_> {
    /// Detach now.
    pub(crate) fn remove(self) {
        drop(self);
    }
}

impl Drop for HookHandle<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

/// A group of handles detached together.
#[derive(Debug, Default)]
pub(crate) struct HandlerList<'r> {
    handles: Vec<HookHandle<'r>>,
}

impl<'r> HandlerList<'r> {
    /// Empty list.
    pub(crate) const fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Add one handle.
    pub(crate) fn push(&mut self, handle: HookHandle<'r>) {
        self.handles.push(handle);
    }

    /// Detach every handle in the list.
    pub(crate) fn remove(&mut self) {
        self.handles.clear();
    }

    /// Number of handles held.
    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the list holds no handle.
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    fn getter(point: usize) -> HookBinding {
        HookBinding::Getter {
            point,
            location: UnitLocation::default(),
        }
    }

    #[test]
    fn handle_drop_detaches() {
        let registry = HookRegistry::default();
        {
            let _h = registry.register("h.0", HookPhase::Post, getter(0));
            assert_eq!(registry.len(), 1);
            assert_eq!(registry.bindings_for("h.0", HookPhase::Post).len(), 1);
            assert!(registry.bindings_for("h.0", HookPhase::Pre).is_empty());
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn handler_list_detaches_all() {
        let registry = HookRegistry::default();
        let mut list = HandlerList::new();
        list.push(registry.register("h.0", HookPhase::Post, getter(0)));
        list.push(registry.register("h.1", HookPhase::Pre, getter(1)));
        let keep = registry.register("h.2", HookPhase::Post, getter(2));
        assert_eq!(list.len(), 2);
        list.remove();
        assert!(list.is_empty());
        assert_eq!(registry.len(), 1);
        keep.remove();
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_counts_strays() {
        let registry = HookRegistry::default();
        let h = registry.register("h.0", HookPhase::Post, getter(0));
        std::mem::forget(h);
        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn hook_output_applies_replacement() {
        struct Zero;
        impl ModuleHooks for Zero {
            fn fire(&mut self, _m: &str, _p: HookPhase, mut args: HookArgs<'_>) -> Result<()> {
                let t = args.primary_mut()?;
                *t = t.zeros_like()?;
                Ok(())
            }
        }
        let x = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let y = hook_output(&mut Zero, "m", x.clone()).unwrap();
        assert_eq!(y.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
        let z = hook_output(&mut NoHooks, "m", x).unwrap();
        assert_eq!(z.sum_all().unwrap().to_scalar::<f32>().unwrap(), 6.0);
    }

    #[test]
    fn primary_prefers_positional_then_kwargs() {
        let a = Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::ones(1, DType::F32, &Device::Cpu).unwrap();

        let mut kwargs = [("hidden_states".to_owned(), b)];
        let mut no_args: [Tensor; 0] = [];
        let mut args = HookArgs::Inputs {
            args: &mut no_args,
            kwargs: &mut kwargs,
        };
        let primary = args.primary_mut().unwrap();
        assert_eq!(primary.to_vec1::<f32>().unwrap(), [1.0]);

        let mut positional = [a];
        let mut args = HookArgs::Inputs {
            args: &mut positional,
            kwargs: &mut kwargs,
        };
        assert_eq!(args.primary_mut().unwrap().to_vec1::<f32>().unwrap(), [0.0]);

        let mut none: [Tensor; 0] = [];
        let mut empty = HookArgs::Outputs(&mut none);
        assert!(matches!(empty.primary_mut(), Err(AlignError::Hook(_))));
    }
}
