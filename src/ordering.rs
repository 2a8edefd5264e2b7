// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution ordering of intervention points.
//!
//! A depth-first walk of the module tree yields the order in which hook
//! events fire during one forward pass: a module's pre-hook fires when it
//! is entered, its post-hook after all of its children have finished.
//! Points are sorted by the position of their `(module, phase)` event.

use std::collections::HashMap;

use crate::error::{AlignError, Result};
use crate::hooks::HookPhase;

/// Hook events of one forward pass, in firing order.
///
/// `paths` must be in depth-first pre-order, with children sharing their
/// parent's path as a dot-separated prefix.
#[must_use]
pub fn hook_events(paths: &[String]) -> Vec<(String, HookPhase)> {
    let mut events = Vec::with_capacity(paths.len() * 2);
    let mut open: Vec<&str> = Vec::new();

    for path in paths {
        while let Some(&top) = open.last() {
            if is_descendant(path, top) {
                break;
            }
            events.push((top.to_owned(), HookPhase::Post));
            open.pop();
        }
        events.push((path.clone(), HookPhase::Pre));
        open.push(path);
    }
    while let Some(top) = open.pop() {
        events.push((top.to_owned(), HookPhase::Post));
    }
    events
}

/// Indices of `targets` sorted by firing order.
///
/// Targets hooked on the same event keep their relative order.
///
/// # Errors
///
/// Returns [`AlignError::Config`] if a target module does not appear in
/// `paths`.
pub fn execution_order(paths: &[String], targets: &[(&str, HookPhase)]) -> Result<Vec<usize>> {
    let position: HashMap<(String, HookPhase), usize> = hook_events(paths)
        .into_iter()
        .enumerate()
        .map(|(i, event)| (event, i))
        .collect();

    let mut ranked = Vec::with_capacity(targets.len());
    for (i, &(module, phase)) in targets.iter().enumerate() {
        let rank = position
            .get(&(module.to_owned(), phase))
            .copied()
            .ok_or_else(|| {
                AlignError::Config(format!("module '{module}' not found in the model structure"))
            })?;
        ranked.push((rank, i));
    }
    ranked.sort_by_key(|&(rank, _)| rank);
    Ok(ranked.into_iter().map(|(_, i)| i).collect())
}

fn is_descendant(path: &str, ancestor: &str) -> bool {
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('.'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
