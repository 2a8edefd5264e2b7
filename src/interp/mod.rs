// SPDX-License-Identifier: MIT OR Apache-2.0

//! Intervention transforms.
//!
//! A transform receives the gathered base slice, the gathered source slice
//! and an optional feature subspace, and returns the slice to scatter back
//! into the live forward pass.
//!
//! - [`intervention`]: fixed transforms (swap, addition, subtraction).
//! - [`rotated`]: learned rotations (full-rank, low-rank, boundless).
//!
//! Trainability is a capability: [`Intervention::trainable`] returns
//! `Some` only for transforms that own [`Var`]s.

pub mod intervention;
pub mod rotated;

use std::fmt;

use candle_core::{Device, Tensor, Var};

use crate::config::{InterventionType, RepresentationDescriptor};
use crate::error::{AlignError, Result};

pub use intervention::{AdditionIntervention, SubtractionIntervention, VanillaIntervention};
pub use rotated::{
    BoundlessRotatedSpaceIntervention, LowRankRotatedSpaceIntervention, RotatedSpaceIntervention,
};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A pluggable activation edit applied by a setter hook.
pub trait Intervention: fmt::Debug {
    /// Short name used in summaries and logs.
    fn name(&self) -> &'static str;

    /// Compute the replacement for `base`.
    ///
    /// `base` and `source` have the same shape, with features on the last
    /// dimension.  When `subspace` is given, features outside it must be
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Intervention`] on shape mismatch or an invalid
    /// subspace.
    fn intervene(
        &self,
        base: &Tensor,
        source: &Tensor,
        subspace: Option<&FeatureSubspace>,
    ) -> Result<Tensor>;

    /// Trainable capability, if this transform has parameters.
    fn trainable(&self) -> Option<&dyn Trainable> {
        None
    }

    /// Mutable trainable capability.
    fn trainable_mut(&mut self) -> Option<&mut dyn Trainable> {
        None
    }
}

/// Parameter handling for learned transforms.
pub trait Trainable {
    /// Parameters to optimise.  Empty while frozen.
    fn vars(&self) -> Vec<Var>;

    /// Freeze (stop gradients through) or unfreeze the parameters.
    fn set_frozen(&mut self, frozen: bool);

    /// Whether the parameters are frozen.
    fn is_frozen(&self) -> bool;

    /// Update the annealing temperature, for transforms that use one.
    fn set_temperature(&mut self, _temperature: f64) {}

    /// Drop accumulated gradients.  Candle keeps gradients in the
    /// `GradStore` returned by `backward()`, so there is nothing to clear
    /// by default.
    fn zero_grad(&mut self) {}

    /// Pull the parameters back onto their constraint set after an
    /// optimiser update.  Rotations must stay orthonormal, otherwise the
    /// back-projection leaks edits outside the requested subspace.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Intervention`] if the parameters cannot be
    /// projected.
    fn restore_constraints(&mut self) -> Result<()> {
        Ok(())
    }

    /// Number of scalar parameters, frozen or not.
    fn num_parameters(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Subspaces
// ---------------------------------------------------------------------------

/// Subspace request for one intervention point.
///
/// Holds one index list per example, or a single list shared by the whole
/// batch.  When the point's descriptor defines a `subspace_partition`, the
/// indices name partitions; otherwise they name features directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    per_example: Vec<Vec<usize>>,
}

impl Subspace {
    /// One index list per example.
    #[must_use]
    pub const fn per_example(indices: Vec<Vec<usize>>) -> Self {
        Self {
            per_example: indices,
        }
    }

    /// One index list for every example.
    #[must_use]
    pub fn shared(indices: Vec<usize>) -> Self {
        Self {
            per_example: vec![indices],
        }
    }

    /// Expand partition indices into feature indices.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Intervention`] if a partition index is out of
    /// range.
    pub fn resolve(&self, partition: Option<&[(usize, usize)]>) -> Result<FeatureSubspace> {
        let per_example = match partition {
            None => self.per_example.clone(),
            Some(ranges) => self
                .per_example
                .iter()
                .map(|parts| {
                    let mut features = Vec::new();
                    for &p in parts {
                        let &(start, end) = ranges.get(p).ok_or_else(|| {
                            AlignError::Intervention(format!(
                                "subspace partition {p} out of range ({} partitions)",
                                ranges.len()
                            ))
                        })?;
                        features.extend(start..end);
                    }
                    Ok(features)
                })
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(FeatureSubspace { per_example })
    }
}

/// Feature coordinates a transform may edit, per example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSubspace {
    per_example: Vec<Vec<usize>>,
}

impl FeatureSubspace {
    /// Feature indices, one list per example (or one shared list).
    #[must_use]
    pub fn features(&self) -> &[Vec<usize>] {
        &self.per_example
    }

    /// 0/1 mask broadcastable against `like`.
    ///
    /// # Shapes
    /// - `like`: `[batch, ..., features]`
    /// - returns: `[batch, 1, ..., 1, features]` in `like`'s dtype
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Intervention`] if the batch does not match or a
    /// feature index exceeds the last dimension.
    pub fn mask(&self, like: &Tensor) -> Result<Tensor> {
        let dims = like.dims();
        let (Some(&batch), Some(&width)) = (dims.first(), dims.last()) else {
            return Err(AlignError::Intervention("cannot mask a scalar".into()));
        };
        let rows = self.per_example.len();
        if rows != 1 && rows != batch {
            return Err(AlignError::Intervention(format!(
                "subspace covers {rows} examples, activation has batch {batch}"
            )));
        }

        let mut data = vec![0f32; batch * width];
        for b in 0..batch {
            let features = self.per_example.get(if rows == 1 { 0 } else { b });
            for &f in features.into_iter().flatten() {
                if f >= width {
                    return Err(AlignError::Intervention(format!(
                        "subspace feature {f} out of range for width {width}"
                    )));
                }
                if let Some(slot) = data.get_mut(b * width + f) {
                    *slot = 1.0;
                }
            }
        }

        let mut shape = vec![1usize; dims.len()];
        if let Some(first) = shape.first_mut() {
            *first = batch;
        }
        if let Some(last) = shape.last_mut() {
            *last = width;
        }
        Ok(Tensor::from_vec(data, shape, like.device())?.to_dtype(like.dtype())?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Reject base/source pairs of different shapes.
pub(crate) fn check_pair(name: &str, base: &Tensor, source: &Tensor) -> Result<()> {
    if base.dims() == source.dims() {
        Ok(())
    } else {
        Err(AlignError::Intervention(format!(
            "{name}: base shape {:?} differs from source shape {:?}",
            base.dims(),
            source.dims()
        )))
    }
}

/// `base * (1 - mask) + other * mask`.
pub(crate) fn blend(base: &Tensor, other: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let keep = mask.affine(-1.0, 1.0)?;
    Ok((base.broadcast_mul(&keep)? + other.broadcast_mul(mask)?)?)
}

/// Instantiate a built-in transform for a point with `feature_dim`
/// features.
///
/// # Errors
///
/// Returns [`AlignError::Config`] if a low-rank transform has no usable
/// rank, or [`AlignError::Model`] if parameter allocation fails.
pub fn build_intervention(
    ty: InterventionType,
    feature_dim: usize,
    descriptor: &RepresentationDescriptor,
    device: &Device,
) -> Result<Box<dyn Intervention>> {
    // TRAIT_OBJECT: transforms are chosen per point at runtime
    let built: Box<dyn Intervention> = match ty {
        InterventionType::Vanilla => Box::new(VanillaIntervention),
        InterventionType::Addition => Box::new(AdditionIntervention),
        InterventionType::Subtraction => Box::new(SubtractionIntervention),
        InterventionType::RotatedSpace => {
            Box::new(RotatedSpaceIntervention::new(feature_dim, device)?)
        }
        InterventionType::LowRankRotatedSpace => {
            let rank = descriptor.low_rank_dimension.ok_or_else(|| {
                AlignError::Config(format!(
                    "{ty} at layer {} needs low_rank_dimension",
                    descriptor.layer
                ))
            })?;
            Box::new(LowRankRotatedSpaceIntervention::new(feature_dim, rank, device)?)
        }
        InterventionType::BoundlessRotatedSpace => {
            Box::new(BoundlessRotatedSpaceIntervention::new(feature_dim, device)?)
        }
    };
    Ok(built)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::DType;

    use super::*;
    use crate::config::RepresentationKind;

    #[test]
    fn partition_expands_to_features() {
        let sub = Subspace::shared(vec![1]);
        let features = sub.resolve(Some(&[(0, 2), (2, 5)])).unwrap();
        assert_eq!(features.features(), &[vec![2, 3, 4]]);
        assert!(sub.resolve(Some(&[(0, 2)])).is_err());
        assert_eq!(sub.resolve(None).unwrap().features(), &[vec![1]]);
    }

    #[test]
    fn mask_shape_and_values() {
        let like = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let mask = Subspace::per_example(vec![vec![0], vec![1, 3]])
            .resolve(None)
            .unwrap()
            .mask(&like)
            .unwrap();
        assert_eq!(mask.dims(), &[2, 1, 4]);
        let rows: Vec<Vec<Vec<f32>>> = mask.to_vec3().unwrap();
        assert_eq!(rows[0][0], [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(rows[1][0], [0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn mask_rejects_bad_features() {
        let like = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let too_wide = Subspace::shared(vec![4]).resolve(None).unwrap();
        assert!(too_wide.mask(&like).is_err());
        let wrong_batch = Subspace::per_example(vec![vec![0], vec![0], vec![0]])
            .resolve(None)
            .unwrap();
        assert!(wrong_batch.mask(&like).is_err());
    }

    #[test]
    fn low_rank_requires_rank() {
        let desc = RepresentationDescriptor::new(0, RepresentationKind::BlockOutput, "pos", 1);
        let err = build_intervention(InterventionType::LowRankRotatedSpace, 8, &desc, &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, AlignError::Config(_)));
        let ok = build_intervention(
            InterventionType::LowRankRotatedSpace,
            8,
            &desc.with_low_rank_dimension(2),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(ok.trainable().unwrap().num_parameters(), 16);
    }

    #[test]
    fn fixed_types_are_not_trainable() {
        let desc = RepresentationDescriptor::new(0, RepresentationKind::BlockOutput, "pos", 1);
        for ty in [
            InterventionType::Vanilla,
            InterventionType::Addition,
            InterventionType::Subtraction,
        ] {
            let built = build_intervention(ty, 8, &desc, &Device::Cpu).unwrap();
            assert!(built.trainable().is_none());
        }
    }
}
