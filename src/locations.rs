// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unit locations and batch location preprocessing.
//!
//! A [`UnitLocation`] holds, for each level of a unit chain (`"h"`, then
//! `"pos"`), one index list per batch example.  [`UnitLocations`] groups
//! them per source pairing:
//!
//! - parallel mode: one group `"sources->base"`, with one source-side and
//!   one base-side location per intervention point;
//! - serial mode: one group per adjacent pair, `"source_i->source_{i+1}"`
//!   and finally `"source_{n-1}->base"`, each with a single location pair.
//!
//! Training batches carry locations flattened under keys such as
//! `"source_0->base.1.pos"` (pairing, side `0` = source / `1` = base,
//! level); [`UnitLocations::from_flat`] rebuilds the nested form.

use std::collections::BTreeMap;

use crate::config::Mode;
use crate::error::{AlignError, Result};
use crate::units::UnitSpec;

/// One index list per batch example.
pub type BatchIndices = Vec<Vec<usize>>;

/// Name of the single location group used in parallel mode.
pub const SOURCES_TO_BASE: &str = "sources->base";

// ---------------------------------------------------------------------------
// UnitLocation
// ---------------------------------------------------------------------------

/// Per-level, per-example indices addressing units of one activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitLocation {
    levels: Vec<BatchIndices>,
}

impl UnitLocation {
    /// Location with one entry per unit level, outermost first.
    #[must_use]
    pub const fn new(levels: Vec<BatchIndices>) -> Self {
        Self { levels }
    }

    /// Single-level location (`"pos"` or `"h"`).
    #[must_use]
    pub fn single(indices: BatchIndices) -> Self {
        Self {
            levels: vec![indices],
        }
    }

    /// All levels.
    #[must_use]
    pub fn levels(&self) -> &[BatchIndices] {
        &self.levels
    }

    /// Indices of level `i`.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Location`] if the level is absent.
    pub fn level(&self, i: usize) -> Result<&BatchIndices> {
        self.levels.get(i).ok_or_else(|| {
            AlignError::Location(format!(
                "location has {} level(s), level {i} requested",
                self.levels.len()
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// LocationPair / UnitLocations
// ---------------------------------------------------------------------------

/// Source-side and base-side locations of one pairing group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationPair {
    /// Where each point gathers from its source run.
    pub sources: Vec<UnitLocation>,
    /// Where each point writes in the receiving run.
    pub base: Vec<UnitLocation>,
}

impl LocationPair {
    /// Pair of equally long location lists.
    #[must_use]
    pub const fn new(sources: Vec<UnitLocation>, base: Vec<UnitLocation>) -> Self {
        Self { sources, base }
    }

    /// Pair holding one source and one base location.
    #[must_use]
    pub fn single(source: UnitLocation, base: UnitLocation) -> Self {
        Self {
            sources: vec![source],
            base: vec![base],
        }
    }
}

/// Location groups of one `forward`/`generate` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitLocations {
    groups: BTreeMap<String, LocationPair>,
}

impl UnitLocations {
    /// No groups.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parallel-mode locations: point `i` gathers at `sources[i]` and
    /// writes at `base[i]`.
    #[must_use]
    pub fn parallel(sources: Vec<UnitLocation>, base: Vec<UnitLocation>) -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(SOURCES_TO_BASE.to_owned(), LocationPair::new(sources, base));
        Self { groups }
    }

    /// Group key of serial step `index` out of `count`.
    #[must_use]
    pub fn serial_key(index: usize, count: usize) -> String {
        if index + 1 == count {
            format!("source_{index}->base")
        } else {
            format!("source_{index}->source_{}", index + 1)
        }
    }

    /// Add or replace a group.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, pair: LocationPair) -> Self {
        self.groups.insert(key.into(), pair);
        self
    }

    /// Group under `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&LocationPair> {
        self.groups.get(key)
    }

    /// Whether a group exists under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.groups.contains_key(key)
    }

    /// Group under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if it is missing.
    pub fn require(&self, key: &str) -> Result<&LocationPair> {
        self.groups
            .get(key)
            .ok_or_else(|| AlignError::Config(format!("unit locations lack group '{key}'")))
    }

    /// Group names.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Rebuild nested locations from a flat batch map.
    ///
    /// `units` lists each intervention point's unit spec in point order.
    /// Point `i` reads `"{pairing}.{side}.{level}"` for every level of its
    /// unit, where `pairing` is `source_i->base` in parallel mode and the
    /// adjacent-pair key in serial mode.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Location`] if a required key is absent.
    pub fn from_flat(
        flat: &BTreeMap<String, BatchIndices>,
        units: &[UnitSpec],
        mode: Mode,
    ) -> Result<Self> {
        let side = |prefix: &str, which: usize, unit: UnitSpec| -> Result<UnitLocation> {
            let levels = unit
                .levels()
                .iter()
                .map(|level| {
                    let key = format!("{prefix}.{which}.{level}");
                    flat.get(&key)
                        .cloned()
                        .ok_or_else(|| AlignError::Location(format!("batch lacks location '{key}'")))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(UnitLocation::new(levels))
        };

        match mode {
            Mode::Parallel => {
                let mut sources = Vec::with_capacity(units.len());
                let mut base = Vec::with_capacity(units.len());
                for (i, &unit) in units.iter().enumerate() {
                    let prefix = format!("source_{i}->base");
                    sources.push(side(&prefix, 0, unit)?);
                    base.push(side(&prefix, 1, unit)?);
                }
                Ok(Self::parallel(sources, base))
            }
            Mode::Serial => {
                let mut locations = Self::new();
                for (i, &unit) in units.iter().enumerate() {
                    let prefix = Self::serial_key(i, units.len());
                    let pair = LocationPair::single(side(&prefix, 0, unit)?, side(&prefix, 1, unit)?);
                    locations.groups.insert(prefix, pair);
                }
                Ok(locations)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
