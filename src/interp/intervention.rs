// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed (parameter-free) intervention transforms.
//!
//! ## Transforms
//!
//! - **Vanilla**: interchange; the source slice replaces the base slice.
//! - **Addition**: the source slice is added to the base slice.
//! - **Subtraction**: the source slice is subtracted from the base slice.
//!
//! With a subspace, each transform only touches the selected features.

use candle_core::Tensor;

use super::{FeatureSubspace, Intervention, blend, check_pair};
use crate::error::Result;

/// Interchange intervention: `base[S] = source[S]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VanillaIntervention;

impl Intervention for VanillaIntervention {
    fn name(&self) -> &'static str {
        "vanilla"
    }

    fn intervene(
        &self,
        base: &Tensor,
        source: &Tensor,
        subspace: Option<&FeatureSubspace>,
    ) -> Result<Tensor> {
        check_pair(self.name(), base, source)?;
        match subspace {
            None => Ok(source.clone()),
            Some(s) => blend(base, source, &s.mask(base)?),
        }
    }
}

/// Additive intervention: `base[S] += source[S]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdditionIntervention;

impl Intervention for AdditionIntervention {
    fn name(&self) -> &'static str {
        "addition"
    }

    fn intervene(
        &self,
        base: &Tensor,
        source: &Tensor,
        subspace: Option<&FeatureSubspace>,
    ) -> Result<Tensor> {
        check_pair(self.name(), base, source)?;
        match subspace {
            None => Ok((base + source)?),
            Some(s) => Ok((base + source.broadcast_mul(&s.mask(base)?)?)?),
        }
    }
}

/// Subtractive intervention: `base[S] -= source[S]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubtractionIntervention;

impl Intervention for SubtractionIntervention {
    fn name(&self) -> &'static str {
        "subtraction"
    }

    fn intervene(
        &self,
        base: &Tensor,
        source: &Tensor,
        subspace: Option<&FeatureSubspace>,
    ) -> Result<Tensor> {
        check_pair(self.name(), base, source)?;
        match subspace {
            None => Ok((base - source)?),
            Some(s) => Ok((base - source.broadcast_mul(&s.mask(base)?)?)?),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
