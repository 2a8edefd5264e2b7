// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation cache keyed by intervention point.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{AlignError, Result};
use crate::keys::InterventionKey;

/// Source slices captured during one call, keyed by intervention point.
///
/// # Example
///
/// ```
/// use candle_align::{ActivationCache, InterventionKey};
/// use candle_core::{DType, Device, Tensor};
///
/// let mut cache = ActivationCache::new();
/// let key = InterventionKey::from("layer.0.repr.block_output.unit.pos.nunit.1#0");
/// cache.store(key.clone(), Tensor::zeros((2, 1, 8), DType::F32, &Device::Cpu).unwrap());
/// assert_eq!(cache.len(), 1);
/// assert!(cache.get(&key).is_some());
/// cache.clear();
/// assert!(cache.is_empty());
/// ```
#[derive(Debug, Default, Clone)]
pub struct ActivationCache {
    activations: HashMap<InterventionKey, Tensor>,
}

impl ActivationCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or overwrite) the slice captured for `key`.
    pub fn store(&mut self, key: InterventionKey, tensor: Tensor) {
        self.activations.insert(key, tensor);
    }

    /// Slice captured for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &InterventionKey) -> Option<&Tensor> {
        self.activations.get(key)
    }

    /// Slice captured for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::State`] if nothing was captured.
    pub fn require(&self, key: &InterventionKey) -> Result<&Tensor> {
        self.get(key)
            .ok_or_else(|| AlignError::State(format!("no activation captured for '{key}'")))
    }

    /// Whether a slice is stored for `key`.
    #[must_use]
    pub fn contains(&self, key: &InterventionKey) -> bool {
        self.activations.contains_key(key)
    }

    /// Number of cached slices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.activations.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Keys with a cached slice (unordered).
    pub fn keys(&self) -> impl Iterator<Item = &InterventionKey> {
        self.activations.keys()
    }

    /// Drop every slice.
    pub fn clear(&mut self) {
        self.activations.clear();
    }
}

impl FromIterator<(InterventionKey, Tensor)> for ActivationCache {
    fn from_iter<I: IntoIterator<Item = (InterventionKey, Tensor)>>(iter: I) -> Self {
        Self {
            activations: iter.into_iter().collect(),
        }
    }
}
