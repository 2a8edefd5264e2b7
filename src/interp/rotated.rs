// SPDX-License-Identifier: MIT OR Apache-2.0

//! Learned rotation interventions.
//!
//! Base and source are projected with a learned matrix `W`, interchanged
//! in the projected space, and projected back with `W^T`:
//!
//! ```text
//! rb = base @ W,  rs = source @ W
//! out = (rb * (1 - m) + rs * m) @ W^T          (full rank)
//! out = base + ((rs - rb) * m) @ W^T           (low rank)
//! ```
//!
//! `m` is the subspace mask (all ones without a subspace).  The boundless
//! variant multiplies `m` by a soft interval mask over the rotated
//! coordinates whose width is learned and whose sharpness is annealed
//! through [`Trainable::set_temperature`].
//!
//! `W` is a plain [`Var`] updated by the optimiser; after every update
//! [`Trainable::restore_constraints`] re-orthonormalises its columns, so
//! `W^T W = I` holds whenever the transform runs.

use candle_core::{D, DType, Device, Tensor, Var};

use super::{FeatureSubspace, Intervention, Trainable, blend, check_pair};
use crate::error::{AlignError, Result};

/// Rotation parameter as a tensor in `dtype`, detached when frozen.
fn weight(var: &Var, dtype: DType, frozen: bool) -> Result<Tensor> {
    let w = var.as_tensor().to_dtype(dtype)?;
    Ok(if frozen { w.detach() } else { w })
}

fn subspace_mask(rotated: &Tensor, subspace: Option<&FeatureSubspace>) -> Result<Option<Tensor>> {
    subspace.map(|s| s.mask(rotated)).transpose()
}

/// Replace the `[dim, k]` matrix held by `var` with the orthonormal factor
/// of its QR decomposition (modified Gram-Schmidt over the columns).
///
/// The factor keeps the column orientation, so an already orthonormal
/// matrix is returned unchanged up to rounding.
fn orthonormalize_columns(var: &Var) -> Result<()> {
    let (dim, k) = var.dims2()?;
    // one row per column of W, in f64 to keep the projections stable
    let mut columns: Vec<Vec<f64>> = var
        .as_tensor()
        .to_dtype(DType::F64)?
        .t()?
        .contiguous()?
        .to_vec2()?;

    for j in 0..columns.len() {
        let (done, rest) = columns.split_at_mut(j);
        let Some(column) = rest.first_mut() else {
            break;
        };
        for q in done.iter() {
            let dot: f64 = q.iter().zip(column.iter()).map(|(a, b)| a * b).sum();
            for (c, qi) in column.iter_mut().zip(q) {
                *c -= dot * qi;
            }
        }
        let norm = column.iter().map(|c| c * c).sum::<f64>().sqrt();
        if norm < 1e-12 {
            return Err(AlignError::Intervention(format!(
                "rotation column {j} collapsed onto the previous ones"
            )));
        }
        for c in column.iter_mut() {
            *c /= norm;
        }
    }

    let flat: Vec<f64> = columns.into_iter().flatten().collect();
    let orthonormal = Tensor::from_vec(flat, (k, dim), var.device())?
        .t()?
        .contiguous()?
        .to_dtype(var.dtype())?;
    var.set(&orthonormal)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// RotatedSpaceIntervention
// ---------------------------------------------------------------------------

/// Interchange inside a learned `[dim, dim]` rotation, initialised to the
/// identity.
#[derive(Debug)]
pub struct RotatedSpaceIntervention {
    rotation: Var,
    frozen: bool,
}

impl RotatedSpaceIntervention {
    /// New identity rotation over `dim` features.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Model`] if allocation fails.
    pub fn new(dim: usize, device: &Device) -> Result<Self> {
        let rotation = Var::from_tensor(&Tensor::eye(dim, DType::F32, device)?)?;
        Ok(Self {
            rotation,
            frozen: false,
        })
    }

    /// The rotation matrix.
    #[must_use]
    pub fn rotation(&self) -> &Tensor {
        self.rotation.as_tensor()
    }
}

impl Intervention for RotatedSpaceIntervention {
    fn name(&self) -> &'static str {
        "rotated_space"
    }

    fn intervene(
        &self,
        base: &Tensor,
        source: &Tensor,
        subspace: Option<&FeatureSubspace>,
    ) -> Result<Tensor> {
        check_pair(self.name(), base, source)?;
        let w = weight(&self.rotation, base.dtype(), self.frozen)?;
        let rotated_base = base.broadcast_matmul(&w)?;
        let rotated_source = source.broadcast_matmul(&w)?;
        let mixed = match subspace_mask(&rotated_base, subspace)? {
            Some(m) => blend(&rotated_base, &rotated_source, &m)?,
            None => rotated_source,
        };
        Ok(mixed.broadcast_matmul(&w.t()?)?)
    }

    fn trainable(&self) -> Option<&dyn Trainable> {
        Some(self)
    }

    fn trainable_mut(&mut self) -> Option<&mut dyn Trainable> {
        Some(self)
    }
}

impl Trainable for RotatedSpaceIntervention {
    fn vars(&self) -> Vec<Var> {
        if self.frozen {
            Vec::new()
        } else {
            vec![self.rotation.clone()]
        }
    }

    fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn restore_constraints(&mut self) -> Result<()> {
        orthonormalize_columns(&self.rotation)
    }

    fn num_parameters(&self) -> usize {
        self.rotation.elem_count()
    }
}

// ---------------------------------------------------------------------------
// LowRankRotatedSpaceIntervention
// ---------------------------------------------------------------------------

/// Interchange inside a learned `[dim, rank]` projection.
///
/// Initialised to the first `rank` standard basis vectors, so the
/// untrained transform swaps the first `rank` features.
#[derive(Debug)]
pub struct LowRankRotatedSpaceIntervention {
    projection: Var,
    frozen: bool,
}

impl LowRankRotatedSpaceIntervention {
    /// New projection from `dim` features onto `rank` coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if `rank` is zero or exceeds `dim`.
    pub fn new(dim: usize, rank: usize, device: &Device) -> Result<Self> {
        if rank == 0 || rank > dim {
            return Err(AlignError::Config(format!(
                "low-rank dimension {rank} must be in 1..={dim}"
            )));
        }
        let basis = Tensor::eye(dim, DType::F32, device)?.narrow(1, 0, rank)?;
        Ok(Self {
            projection: Var::from_tensor(&basis.contiguous()?)?,
            frozen: false,
        })
    }

    /// Rank of the projection.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.projection.dims().get(1).copied().unwrap_or(0)
    }
}

impl Intervention for LowRankRotatedSpaceIntervention {
    fn name(&self) -> &'static str {
        "low_rank_rotated_space"
    }

    fn intervene(
        &self,
        base: &Tensor,
        source: &Tensor,
        subspace: Option<&FeatureSubspace>,
    ) -> Result<Tensor> {
        check_pair(self.name(), base, source)?;
        let w = weight(&self.projection, base.dtype(), self.frozen)?;
        let rotated_base = base.broadcast_matmul(&w)?;
        let rotated_source = source.broadcast_matmul(&w)?;
        let mut delta = (rotated_source - &rotated_base)?;
        if let Some(m) = subspace_mask(&rotated_base, subspace)? {
            delta = delta.broadcast_mul(&m)?;
        }
        Ok((base + delta.broadcast_matmul(&w.t()?)?)?)
    }

    fn trainable(&self) -> Option<&dyn Trainable> {
        Some(self)
    }

    fn trainable_mut(&mut self) -> Option<&mut dyn Trainable> {
        Some(self)
    }
}

impl Trainable for LowRankRotatedSpaceIntervention {
    fn vars(&self) -> Vec<Var> {
        if self.frozen {
            Vec::new()
        } else {
            vec![self.projection.clone()]
        }
    }

    fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn restore_constraints(&mut self) -> Result<()> {
        orthonormalize_columns(&self.projection)
    }

    fn num_parameters(&self) -> usize {
        self.projection.elem_count()
    }
}

// ---------------------------------------------------------------------------
// BoundlessRotatedSpaceIntervention
// ---------------------------------------------------------------------------

/// Interchange inside a learned rotation over a learned prefix of the
/// rotated coordinates.
///
/// The prefix mask is `sigmoid(i / T) * sigmoid((b * dim - i) / T)` for
/// rotated coordinate `i`, boundary `b` clamped to `[1e-3, 1]`, and
/// temperature `T`.
#[derive(Debug)]
pub struct BoundlessRotatedSpaceIntervention {
    rotation: Var,
    boundaries: Var,
    temperature: f64,
    frozen: bool,
}

impl BoundlessRotatedSpaceIntervention {
    /// Initial boundary, as a fraction of the feature dimension.
    pub const INITIAL_BOUNDARY: f32 = 0.5;

    /// Initial temperature; matches the start of the default annealing
    /// schedule.
    pub const INITIAL_TEMPERATURE: f64 = 50.0;

    /// New identity rotation over `dim` features with a half-width boundary.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Model`] if allocation fails.
    pub fn new(dim: usize, device: &Device) -> Result<Self> {
        let rotation = Var::from_tensor(&Tensor::eye(dim, DType::F32, device)?)?;
        let boundaries = Var::from_tensor(&Tensor::new(
            &[Self::INITIAL_BOUNDARY, Self::INITIAL_BOUNDARY],
            device,
        )?)?;
        Ok(Self {
            rotation,
            boundaries,
            temperature: Self::INITIAL_TEMPERATURE,
            frozen: false,
        })
    }

    /// Current temperature.
    #[must_use]
    pub const fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Soft prefix mask over `dim` rotated coordinates, shape `[dim]`.
    fn boundary_mask(&self, dim: usize, dtype: DType, device: &Device) -> Result<Tensor> {
        let boundaries = weight(&self.boundaries, DType::F32, self.frozen)?;
        let upper = (boundaries.clamp(1e-3f32, 1f32)?.narrow(0, 0, 1)? * dim as f64)?;
        let population = Tensor::arange(0u32, dim as u32, device)?.to_dtype(DType::F32)?;
        let rising = candle_nn::ops::sigmoid(&(&population / self.temperature)?)?;
        let falling =
            candle_nn::ops::sigmoid(&(upper.broadcast_sub(&population)? / self.temperature)?)?;
        Ok((rising * falling)?.to_dtype(dtype)?)
    }
}

impl Intervention for BoundlessRotatedSpaceIntervention {
    fn name(&self) -> &'static str {
        "boundless_rotated_space"
    }

    fn intervene(
        &self,
        base: &Tensor,
        source: &Tensor,
        subspace: Option<&FeatureSubspace>,
    ) -> Result<Tensor> {
        check_pair(self.name(), base, source)?;
        let w = weight(&self.rotation, base.dtype(), self.frozen)?;
        let rotated_base = base.broadcast_matmul(&w)?;
        let rotated_source = source.broadcast_matmul(&w)?;
        let dim = rotated_base.dim(D::Minus1)?;
        let mut mask = self.boundary_mask(dim, base.dtype(), base.device())?;
        if let Some(m) = subspace_mask(&rotated_base, subspace)? {
            mask = m.broadcast_mul(&mask)?;
        }
        let mixed = blend(&rotated_base, &rotated_source, &mask)?;
        Ok(mixed.broadcast_matmul(&w.t()?)?)
    }

    fn trainable(&self) -> Option<&dyn Trainable> {
        Some(self)
    }

    fn trainable_mut(&mut self) -> Option<&mut dyn Trainable> {
        Some(self)
    }
}

impl Trainable for BoundlessRotatedSpaceIntervention {
    fn vars(&self) -> Vec<Var> {
        if self.frozen {
            Vec::new()
        } else {
            vec![self.rotation.clone(), self.boundaries.clone()]
        }
    }

    fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
    }

    fn restore_constraints(&mut self) -> Result<()> {
        orthonormalize_columns(&self.rotation)
    }

    fn num_parameters(&self) -> usize {
        self.rotation.elem_count() + self.boundaries.elem_count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
