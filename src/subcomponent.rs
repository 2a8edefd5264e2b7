// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sub-component extraction and injection.
//!
//! A hooked module's primary tensor is `[batch, seq, width]`.  For fused
//! projections (GPT-2's `c_attn` packs Q, K and V side by side) the
//! representation is a `narrow()` slice of the last dimension; per-head
//! kinds are further reshaped to `[batch, heads, seq, head_dim]`.
//! [`inject`] undoes both steps and leaves every other element of the raw
//! tensor untouched, so `inject(raw, extract(raw, t), t) == raw`.

use candle_core::{D, Tensor};

use crate::error::{AlignError, Result};
use crate::mapping::ResolvedTarget;

/// Carve the representation addressed by `target` out of `raw`.
///
/// # Shapes
/// - `raw`: `[batch, seq, width]`
/// - returns: `[batch, seq, len]`, or `[batch, heads, seq, len / heads]`
///
/// # Errors
///
/// Returns [`AlignError::Hook`] if `raw` is not rank 3 or is narrower than
/// the target slice.
pub fn extract(raw: &Tensor, target: &ResolvedTarget) -> Result<Tensor> {
    let (batch, seq, width) = raw.dims3().map_err(|_| {
        AlignError::Hook(format!(
            "{}: expected a [batch, seq, hidden] tensor, got {:?}",
            target.module,
            raw.dims()
        ))
    })?;

    let part = match target.slice {
        Some((offset, len)) => {
            if offset + len > width {
                return Err(AlignError::Hook(format!(
                    "{}: slice [{offset}, {}) exceeds width {width}",
                    target.module,
                    offset + len
                )));
            }
            raw.narrow(D::Minus1, offset, len)?
        }
        None => raw.clone(),
    };

    match target.heads {
        Some(heads) => {
            let len = part.dim(D::Minus1)?;
            // CONTIGUOUS: narrow() leaves a strided view; reshape needs a dense one
            Ok(part
                .contiguous()?
                .reshape((batch, seq, heads, len / heads))?
                .transpose(1, 2)?
                .contiguous()?)
        }
        None => Ok(part),
    }
}

/// Write `replacement` back into the part of `raw` addressed by `target`.
///
/// # Errors
///
/// Returns [`AlignError::Hook`] if `raw` is not rank 3 or is narrower than
/// the target slice, and [`AlignError::Intervention`] if `replacement`
/// does not have the shape [`extract`] produces.
pub fn inject(raw: &Tensor, replacement: &Tensor, target: &ResolvedTarget) -> Result<Tensor> {
    let (batch, seq, width) = raw.dims3().map_err(|_| {
        AlignError::Hook(format!(
            "{}: expected a [batch, seq, hidden] tensor, got {:?}",
            target.module,
            raw.dims()
        ))
    })?;
    let len = target.slice.map_or(width, |(_, len)| len);

    let merged = match target.heads {
        Some(heads) => {
            if replacement.dims() != [batch, heads, seq, len / heads] {
                return Err(shape_error(target, replacement, &[batch, heads, seq, len / heads]));
            }
            replacement
                .transpose(1, 2)?
                .contiguous()?
                .reshape((batch, seq, len))?
        }
        None => {
            if replacement.dims() != [batch, seq, len] {
                return Err(shape_error(target, replacement, &[batch, seq, len]));
            }
            replacement.clone()
        }
    };

    match target.slice {
        Some((offset, len)) => {
            let tail = width.checked_sub(offset + len).ok_or_else(|| {
                AlignError::Hook(format!(
                    "{}: slice [{offset}, {}) exceeds width {width}",
                    target.module,
                    offset + len
                ))
            })?;
            let mut parts = Vec::with_capacity(3);
            if offset > 0 {
                parts.push(raw.narrow(D::Minus1, 0, offset)?);
            }
            parts.push(merged);
            if tail > 0 {
                parts.push(raw.narrow(D::Minus1, offset + len, tail)?);
            }
            Ok(Tensor::cat(&parts, D::Minus1)?)
        }
        None => Ok(merged),
    }
}

fn shape_error(target: &ResolvedTarget, replacement: &Tensor, expected: &[usize]) -> AlignError {
    AlignError::Intervention(format!(
        "{}: replacement shape {:?}, expected {expected:?}",
        target.module,
        replacement.dims()
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
