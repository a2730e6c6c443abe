//! Probe coverage matrices.

use crate::{Error, Result};

/// The recorded state of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// The probe fired at least once.
    Hit,
    /// The probe is instrumented but never fired.
    Missed,
    /// No probe exists at this position (absent row or index out of range).
    NotInstrumented,
}

/// A jagged grid of probe flags for one compiled version of a class.
///
/// Each row corresponds to a structural unit of the class (typically a
/// method). A row is `None` when nothing was instrumented for that unit;
/// otherwise every entry records whether the probe at that index fired.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoverageMatrix {
    rows: Vec<Option<Vec<bool>>>,
}

impl CoverageMatrix {
    /// Creates a matrix from raw rows.
    pub fn new(rows: Vec<Option<Vec<bool>>>) -> Self {
        Self { rows }
    }

    /// Creates a new `MatrixBuilder`.
    pub fn builder() -> MatrixBuilder {
        MatrixBuilder::default()
    }

    /// Returns the number of rows, absent rows included.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Returns the probes of row `index`, or `None` if the row is absent
    /// or out of range.
    pub fn row(&self, index: usize) -> Option<&[bool]> {
        self.rows.get(index).and_then(|row| row.as_deref())
    }

    /// Iterates over all rows in order.
    pub fn rows(&self) -> impl Iterator<Item = Option<&[bool]>> {
        self.rows.iter().map(|row| row.as_deref())
    }

    /// Looks up a single probe.
    pub fn probe(&self, row: usize, index: usize) -> ProbeState {
        match self.row(row).and_then(|r| r.get(index)) {
            Some(true) => ProbeState::Hit,
            Some(false) => ProbeState::Missed,
            None => ProbeState::NotInstrumented,
        }
    }

    /// Consumes the matrix and returns its rows.
    pub fn into_rows(self) -> Vec<Option<Vec<bool>>> {
        self.rows
    }

    /// ORs `other` into `self` cell by cell.
    ///
    /// Absent rows in `other` leave the corresponding row untouched; an
    /// absent row in `self` adopts a copy of the row from `other`.
    ///
    /// # Errors
    /// Returns a `StructuralMismatch` if the row counts differ or two
    /// present rows have different lengths. `self` is unchanged on error.
    pub fn merge(&mut self, other: &CoverageMatrix) -> Result<()> {
        self.check_mergeable(other).map_err(|detail| Error::StructuralMismatch {
            class: String::new(),
            detail,
        })?;
        self.merge_unchecked(other);
        Ok(())
    }

    /// Verifies that `other` has the same layout as `self`, describing the
    /// first difference found.
    pub(crate) fn check_mergeable(&self, other: &CoverageMatrix) -> std::result::Result<(), String> {
        if self.rows.len() != other.rows.len() {
            return Err(format!(
                "row count {} does not match {}",
                other.rows.len(),
                self.rows.len()
            ));
        }
        for (i, (lhs, rhs)) in self.rows.iter().zip(&other.rows).enumerate() {
            if let (Some(lhs), Some(rhs)) = (lhs, rhs) {
                if lhs.len() != rhs.len() {
                    return Err(format!(
                        "row {i} has {} probes, expected {}",
                        rhs.len(),
                        lhs.len()
                    ));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn merge_unchecked(&mut self, other: &CoverageMatrix) {
        for (lhs, rhs) in self.rows.iter_mut().zip(&other.rows) {
            let Some(rhs) = rhs else { continue };
            match lhs {
                Some(lhs) => {
                    for (l, r) in lhs.iter_mut().zip(rhs) {
                        *l |= *r;
                    }
                }
                None => *lhs = Some(rhs.clone()),
            }
        }
    }
}

impl From<Vec<Option<Vec<bool>>>> for CoverageMatrix {
    fn from(rows: Vec<Option<Vec<bool>>>) -> Self {
        Self::new(rows)
    }
}

impl From<Vec<Vec<bool>>> for CoverageMatrix {
    fn from(rows: Vec<Vec<bool>>) -> Self {
        Self::new(rows.into_iter().map(Some).collect())
    }
}

/// A builder for creating `CoverageMatrix` instances.
#[derive(Debug, Default)]
pub struct MatrixBuilder {
    rows: Vec<Option<Vec<bool>>>,
}

impl MatrixBuilder {
    /// Appends a row of probes.
    pub fn row(mut self, probes: impl Into<Vec<bool>>) -> Self {
        self.rows.push(Some(probes.into()));
        self
    }

    /// Appends an uninstrumented row.
    pub fn absent_row(mut self) -> Self {
        self.rows.push(None);
        self
    }

    /// Appends a row of `len` probes, none of which fired.
    pub fn missed_row(mut self, len: usize) -> Self {
        self.rows.push(Some(vec![false; len]));
        self
    }

    /// Consumes the builder and returns the matrix.
    pub fn build(self) -> CoverageMatrix {
        CoverageMatrix { rows: self.rows }
    }
}
