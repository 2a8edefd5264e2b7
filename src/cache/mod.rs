// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-call transient state of an alignable model.
//!
//! - [`ActivationCache`]: source slices captured by getter hooks.
//! - [`CallCounters`]: getter/setter invocation counters that tell the
//!   prompt pass apart from decode steps during generation.
//!
//! Both are reset at the start of every `forward`/`generate` call.

mod activation;
mod counters;

pub use activation::ActivationCache;
pub use counters::{CallCounters, HookSide};
