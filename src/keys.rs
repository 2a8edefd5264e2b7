// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stable string keys for intervention points.
//!
//! A key is derived from the addressing fields of a
//! [`RepresentationDescriptor`] plus a collision counter:
//! `layer.{L}.repr.{kind}.unit.{U}.nunit.{N}#{C}`.

use std::collections::HashMap;
use std::fmt;

use crate::config::RepresentationDescriptor;

/// Unique identifier of one intervention point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterventionKey(String);

impl InterventionKey {
    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterventionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InterventionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InterventionKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Hands out collision-free keys in registration order.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    seen: HashMap<String, usize>,
}

impl KeyRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the key for `descriptor`.
    ///
    /// The first descriptor with a given addressing tuple gets `#0`, the
    /// next colliding one `#1`, and so on.
    pub fn register(&mut self, descriptor: &RepresentationDescriptor) -> InterventionKey {
        let base = format!(
            "layer.{}.repr.{}.unit.{}.nunit.{}",
            descriptor.layer, descriptor.representation_kind, descriptor.unit, descriptor.max_units
        );
        let count = self.seen.entry(base.clone()).or_insert(0);
        let key = InterventionKey(format!("{base}#{count}"));
        *count += 1;
        key
    }
}
