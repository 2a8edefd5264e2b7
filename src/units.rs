// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unit-level gather and scatter.
//!
//! A [`UnitSpec`] names the granularity an intervention point addresses
//! inside an activation tensor.  Flat activations are
//! `[batch, seq, features]`; per-head activations are
//! `[batch, heads, seq, head_dim]`.  Gathering keeps the batch dimension
//! and selects, per example, that example's own index list.
//!
//! [`scatter`] is the exact inverse of [`gather`] for the same location:
//! `scatter(t, gather(t, u, l), u, l) == t`.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor};

use crate::error::{AlignError, Result};
use crate::locations::{BatchIndices, UnitLocation};

// ---------------------------------------------------------------------------
// UnitSpec
// ---------------------------------------------------------------------------

/// Granularity chain of an intervention point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitSpec {
    /// The whole activation (`"seq"`); no location levels.
    Sequence,
    /// Selected sequence positions (`"pos"`).
    Pos,
    /// Selected heads (`"h"`); requires a per-head layout.
    Head,
    /// Selected heads, then selected positions within them (`"h.pos"`).
    HeadPos,
}

impl UnitSpec {
    /// Location level names, outermost first.
    #[must_use]
    pub const fn levels(self) -> &'static [&'static str] {
        match self {
            Self::Sequence => &[],
            Self::Pos => &["pos"],
            Self::Head => &["h"],
            Self::HeadPos => &["h", "pos"],
        }
    }

    /// Whether this spec addresses heads.
    #[must_use]
    pub const fn needs_heads(self) -> bool {
        matches!(self, Self::Head | Self::HeadPos)
    }
}

impl fmt::Display for UnitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequence => write!(f, "seq"),
            _ => write!(f, "{}", self.levels().join(".")),
        }
    }
}

impl FromStr for UnitSpec {
    type Err = AlignError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "seq" => Ok(Self::Sequence),
            "pos" => Ok(Self::Pos),
            "h" => Ok(Self::Head),
            "h.pos" => Ok(Self::HeadPos),
            other => Err(AlignError::Config(format!("unsupported unit '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// gather / scatter
// ---------------------------------------------------------------------------

/// Select the units named by `location` from `tensor`.
///
/// # Shapes
/// - `Pos`: `[b, s, d]` -> `[b, n, d]` (or `[b, h, s, dh]` -> `[b, h, n, dh]`)
/// - `Head`: `[b, h, s, dh]` -> `[b, nh, s, dh]`
/// - `HeadPos`: `[b, h, s, dh]` -> `[b, nh, n, dh]`
///
/// # Errors
///
/// Returns [`AlignError::Location`] if a level is missing, the batch sizes
/// disagree, an index is out of range, or the layout lacks heads.
pub fn gather(tensor: &Tensor, unit: UnitSpec, location: &UnitLocation) -> Result<Tensor> {
    match unit {
        UnitSpec::Sequence => Ok(tensor.clone()),
        UnitSpec::Pos => gather_dim(tensor, position_dim(tensor)?, location.level(0)?),
        UnitSpec::Head => {
            require_heads(tensor, unit)?;
            gather_dim(tensor, 1, location.level(0)?)
        }
        UnitSpec::HeadPos => {
            require_heads(tensor, unit)?;
            let heads = gather_dim(tensor, 1, location.level(0)?)?;
            gather_dim(&heads, 2, location.level(1)?)
        }
    }
}

/// Write `replacement` back into the units named by `location`.
///
/// `replacement` must have the shape [`gather`] would produce.  When an
/// index repeats, the last occurrence wins.
///
/// # Errors
///
/// Same conditions as [`gather`], plus [`AlignError::Location`] when
/// `replacement` has the wrong shape.
pub fn scatter(
    tensor: &Tensor,
    replacement: &Tensor,
    unit: UnitSpec,
    location: &UnitLocation,
) -> Result<Tensor> {
    match unit {
        UnitSpec::Sequence => {
            if replacement.dims() != tensor.dims() {
                return Err(AlignError::Location(format!(
                    "replacement shape {:?} does not match activation {:?}",
                    replacement.dims(),
                    tensor.dims()
                )));
            }
            Ok(replacement.clone())
        }
        UnitSpec::Pos => scatter_dim(
            tensor,
            replacement,
            position_dim(tensor)?,
            location.level(0)?,
        ),
        UnitSpec::Head => {
            require_heads(tensor, unit)?;
            scatter_dim(tensor, replacement, 1, location.level(0)?)
        }
        UnitSpec::HeadPos => {
            require_heads(tensor, unit)?;
            let heads = location.level(0)?;
            let selected = gather_dim(tensor, 1, heads)?;
            let edited = scatter_dim(&selected, replacement, 2, location.level(1)?)?;
            scatter_dim(tensor, &edited, 1, heads)
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn position_dim(tensor: &Tensor) -> Result<usize> {
    match tensor.rank() {
        3 => Ok(1),
        4 => Ok(2),
        r => Err(AlignError::Location(format!(
            "cannot address positions in a rank-{r} activation"
        ))),
    }
}

fn require_heads(tensor: &Tensor, unit: UnitSpec) -> Result<()> {
    if tensor.rank() == 4 {
        Ok(())
    } else {
        Err(AlignError::Location(format!(
            "unit '{unit}' needs a per-head activation, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Check `indices` against `tensor` along `dim` and return the common
/// per-example index count.
fn check_indices(tensor: &Tensor, dim: usize, indices: &BatchIndices) -> Result<usize> {
    let batch = tensor.dim(0)?;
    if indices.len() != batch {
        return Err(AlignError::Location(format!(
            "location covers {} examples, activation has batch {batch}",
            indices.len()
        )));
    }
    let size = tensor.dim(dim)?;
    let count = indices.first().map_or(0, Vec::len);
    for (b, row) in indices.iter().enumerate() {
        if row.len() != count {
            return Err(AlignError::Location(format!(
                "example {b} addresses {} units, example 0 addresses {count}",
                row.len()
            )));
        }
        if let Some(&bad) = row.iter().find(|&&i| i >= size) {
            return Err(AlignError::Location(format!(
                "index {bad} out of range for dimension {dim} of size {size} (example {b})"
            )));
        }
    }
    Ok(count)
}

fn index_tensor(indices: &[usize], device: &Device) -> Result<Tensor> {
    let data = indices
        .iter()
        .map(|&i| {
            u32::try_from(i).map_err(|_| AlignError::Location(format!("index {i} overflows u32")))
        })
        .collect::<Result<Vec<u32>>>()?;
    let len = data.len();
    Ok(Tensor::from_vec(data, len, device)?)
}

/// Per-example `index_select` along `dim` (counted with the batch axis).
fn gather_dim(tensor: &Tensor, dim: usize, indices: &BatchIndices) -> Result<Tensor> {
    check_indices(tensor, dim, indices)?;
    let rows = indices
        .iter()
        .enumerate()
        .map(|(b, row)| {
            let idx = index_tensor(row, tensor.device())?;
            Ok(tensor.get(b)?.index_select(&idx, dim - 1)?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&rows, 0)?)
}

/// Per-example overwrite along `dim`: append the replacement rows and
/// re-select through an index map, so gradients reach `replacement`.
fn scatter_dim(
    tensor: &Tensor,
    replacement: &Tensor,
    dim: usize,
    indices: &BatchIndices,
) -> Result<Tensor> {
    let count = check_indices(tensor, dim, indices)?;
    let mut expected = tensor.dims().to_vec();
    if let Some(d) = expected.get_mut(dim) {
        *d = count;
    }
    if replacement.dims() != expected.as_slice() {
        return Err(AlignError::Location(format!(
            "replacement shape {:?}, expected {expected:?}",
            replacement.dims()
        )));
    }

    let size = tensor.dim(dim)?;
    let rows = indices
        .iter()
        .enumerate()
        .map(|(b, row)| {
            let mut map: Vec<usize> = (0..size).collect();
            for (j, &p) in row.iter().enumerate() {
                if let Some(slot) = map.get_mut(p) {
                    *slot = size + j;
                }
            }
            let idx = index_tensor(&map, tensor.device())?;
            let joined = Tensor::cat(&[&tensor.get(b)?, &replacement.get(b)?], dim - 1)?;
            Ok(joined.index_select(&idx, dim - 1)?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&rows, 0)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    fn arange(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::arange(0f32, n as f32, &Device::Cpu)
            .unwrap()
            .reshape(shape)
            .unwrap()
    }

    fn assert_same(a: &Tensor, b: &Tensor) {
        assert_eq!(a.dims(), b.dims());
        let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn parse_units() {
        assert_eq!("pos".parse::<UnitSpec>().unwrap(), UnitSpec::Pos);
        assert_eq!("h.pos".parse::<UnitSpec>().unwrap(), UnitSpec::HeadPos);
        assert_eq!(UnitSpec::HeadPos.to_string(), "h.pos");
        assert_eq!(UnitSpec::Sequence.to_string(), "seq");
        assert!("pos.h".parse::<UnitSpec>().is_err());
    }

    #[test]
    fn gather_positions_per_example() {
        let t = arange(&[2, 4, 3]);
        let loc = UnitLocation::single(vec![vec![0, 2], vec![3, 1]]);
        let g = gather(&t, UnitSpec::Pos, &loc).unwrap();
        assert_eq!(g.dims(), &[2, 2, 3]);
        let rows: Vec<Vec<Vec<f32>>> = g.to_vec3().unwrap();
        assert_eq!(rows[0][0], [0.0, 1.0, 2.0]);
        assert_eq!(rows[0][1], [6.0, 7.0, 8.0]);
        assert_eq!(rows[1][0], [21.0, 22.0, 23.0]);
        assert_eq!(rows[1][1], [15.0, 16.0, 17.0]);
    }

    #[test]
    fn scatter_writes_only_addressed_positions() {
        let t = Tensor::zeros((2, 4, 3), DType::F32, &Device::Cpu).unwrap();
        let loc = UnitLocation::single(vec![vec![1], vec![3]]);
        let repl = Tensor::ones((2, 1, 3), DType::F32, &Device::Cpu).unwrap();
        let out = scatter(&t, &repl, UnitSpec::Pos, &loc).unwrap();
        let rows: Vec<Vec<Vec<f32>>> = out.to_vec3().unwrap();
        assert_eq!(rows[0][1], [1.0, 1.0, 1.0]);
        assert_eq!(rows[0][3], [0.0, 0.0, 0.0]);
        assert_eq!(rows[1][3], [1.0, 1.0, 1.0]);
        assert_eq!(rows[1][1], [0.0, 0.0, 0.0]);
    }

    #[test]
    fn roundtrip_all_units() {
        let flat = arange(&[2, 5, 4]);
        let heads = arange(&[2, 3, 5, 2]);
        let cases = [
            (&flat, UnitSpec::Sequence, UnitLocation::default()),
            (&flat, UnitSpec::Pos, UnitLocation::single(vec![vec![4, 0], vec![2, 2]])),
            (&heads, UnitSpec::Pos, UnitLocation::single(vec![vec![1], vec![3]])),
            (&heads, UnitSpec::Head, UnitLocation::single(vec![vec![2], vec![0]])),
            (
                &heads,
                UnitSpec::HeadPos,
                UnitLocation::new(vec![vec![vec![0, 2], vec![1, 1]], vec![vec![3], vec![0]]]),
            ),
        ];
        for (t, unit, loc) in cases {
            let g = gather(t, unit, &loc).unwrap();
            let back = scatter(t, &g, unit, &loc).unwrap();
            assert_same(t, &back);
        }
    }

    #[test]
    fn head_pos_scatter_targets_one_cell() {
        let t = Tensor::zeros((1, 2, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let loc = UnitLocation::new(vec![vec![vec![1]], vec![vec![2]]]);
        let repl = Tensor::ones((1, 1, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let out = scatter(&t, &repl, UnitSpec::HeadPos, &loc).unwrap();
        assert_eq!(out.sum_all().unwrap().to_scalar::<f32>().unwrap(), 2.0);
        let cell: Vec<f32> = out.get(0).unwrap().get(1).unwrap().get(2).unwrap().to_vec1().unwrap();
        assert_eq!(cell, [1.0, 1.0]);
    }

    #[test]
    fn addressing_errors() {
        let flat = arange(&[2, 4, 3]);
        let out_of_range = UnitLocation::single(vec![vec![4], vec![0]]);
        assert!(matches!(
            gather(&flat, UnitSpec::Pos, &out_of_range),
            Err(AlignError::Location(_))
        ));
        let wrong_batch = UnitLocation::single(vec![vec![0]]);
        assert!(matches!(
            gather(&flat, UnitSpec::Pos, &wrong_batch),
            Err(AlignError::Location(_))
        ));
        let ragged = UnitLocation::single(vec![vec![0], vec![0, 1]]);
        assert!(matches!(
            gather(&flat, UnitSpec::Pos, &ragged),
            Err(AlignError::Location(_))
        ));
        let ok = UnitLocation::single(vec![vec![0], vec![1]]);
        assert!(matches!(
            gather(&flat, UnitSpec::Head, &ok),
            Err(AlignError::Location(_))
        ));
        assert!(matches!(
            gather(&flat, UnitSpec::HeadPos, &UnitLocation::default()),
            Err(AlignError::Location(_))
        ));
    }
}
