// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook invocation counters for generation gating.
//!
//! During generation every hooked module fires once for the prompt and
//! once per decode step.  The first invocation of a hook is the prompt
//! pass.  With `intervene_on_prompt`, only that first invocation is
//! active; without it, only the later (decode-step) invocations are.

use std::collections::HashMap;

use crate::keys::InterventionKey;

/// Which hook of an intervention point is firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookSide {
    /// Capturing hook.
    Getter,
    /// Injecting hook.
    Setter,
}

/// Per-key invocation counters, one table per hook side.
#[derive(Debug, Default, Clone)]
pub struct CallCounters {
    getter: HashMap<InterventionKey, usize>,
    setter: HashMap<InterventionKey, usize>,
}

impl CallCounters {
    /// Fresh counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one invocation and decide whether it should act.
    ///
    /// Outside generation (`generation` is `None`) every invocation acts
    /// and nothing is counted.  With `Some(intervene_on_prompt)`, the
    /// counter advances on the prompt call, and on every call when
    /// `intervene_on_prompt` is false; the call acts when it is the prompt
    /// call exactly when `intervene_on_prompt` is true.
    pub fn tick(&mut self, side: HookSide, key: &InterventionKey, generation: Option<bool>) -> bool {
        let Some(intervene_on_prompt) = generation else {
            return true;
        };
        let table = match side {
            HookSide::Getter => &mut self.getter,
            HookSide::Setter => &mut self.setter,
        };
        let count = table.entry(key.clone()).or_insert(0);
        let is_prompt = *count == 0;
        if !intervene_on_prompt || is_prompt {
            *count += 1;
        }
        intervene_on_prompt == is_prompt
    }

    /// Invocations counted for `key` on `side`.
    #[must_use]
    pub fn count(&self, side: HookSide, key: &InterventionKey) -> usize {
        let table = match side {
            HookSide::Getter => &self.getter,
            HookSide::Setter => &self.setter,
        };
        table.get(key).copied().unwrap_or(0)
    }

    /// Reset both tables.
    pub fn reset(&mut self) {
        self.getter.clear();
        self.setter.clear();
    }
}
