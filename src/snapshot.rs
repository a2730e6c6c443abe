//! Stamped coverage observations.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use tracing::trace;

use crate::matrix::CoverageMatrix;
use crate::Error;

/// Identifies one compiled version of a class.
///
/// Snapshots with equal stamps share an instrumentation layout and can be
/// merged cell by cell.
pub type Stamp = i64;

/// One observation of a class's coverage, captured against a [`Stamp`].
///
/// Snapshots are handed around as `Arc<Snapshot>`. Consolidation ORs later
/// observations into the first snapshot and swaps in the merged matrix, so
/// every store sharing that `Arc` sees the result. Readers get an
/// `Arc<CoverageMatrix>` and never hold the snapshot's lock.
#[derive(Debug)]
pub struct Snapshot {
    stamp: Stamp,
    matrix: RwLock<Arc<CoverageMatrix>>,
}

impl Snapshot {
    /// Creates a snapshot of `matrix` captured against `stamp`.
    pub fn new(matrix: CoverageMatrix, stamp: Stamp) -> Self {
        Self {
            stamp,
            matrix: RwLock::new(Arc::new(matrix)),
        }
    }

    /// Returns the class version this snapshot was captured against.
    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    /// Returns the current matrix.
    ///
    /// The returned view is fixed at the time of the call; a later
    /// consolidation installs a new matrix instead of editing this one.
    pub fn matrix(&self) -> Arc<CoverageMatrix> {
        Arc::clone(&self.matrix.read())
    }

    /// Returns a detached copy of the current matrix.
    pub fn to_matrix(&self) -> CoverageMatrix {
        CoverageMatrix::clone(&self.matrix())
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.stamp == other.stamp && self.matrix() == other.matrix()
    }
}

impl Eq for Snapshot {}

/// Collapses a same-stamp pending list into its first snapshot.
///
/// Later snapshots are ORed into the first one and the list is replaced by
/// that single entry. A list of one is returned as is. On a layout
/// mismatch nothing is mutated.
pub(crate) fn consolidate(class: &str, pending: &mut Vec<Arc<Snapshot>>) -> crate::Result<Arc<Snapshot>> {
    let Some(first) = pending.first().cloned() else {
        return Err(Error::InvalidArgument(format!(
            "no coverage recorded for {class}"
        )));
    };
    if pending.len() == 1 {
        return Ok(first);
    }

    // Take the other views before locking the accumulator so no two
    // snapshot locks are ever held at the same time.
    let others: Vec<Arc<CoverageMatrix>> = pending[1..]
        .iter()
        .filter(|s| !Arc::ptr_eq(s, &first))
        .map(|s| s.matrix())
        .collect();

    // Upgradable: concurrent consolidations of the same snapshot serialize
    // here, while plain readers only ever hold the lock to clone the Arc.
    let current = first.matrix.upgradable_read();
    let mut merged = CoverageMatrix::clone(&current);
    for other in &others {
        merged
            .check_mergeable(other)
            .map_err(|detail| Error::StructuralMismatch {
                class: class.to_string(),
                detail,
            })?;
    }
    for other in &others {
        merged.merge_unchecked(other);
    }
    *RwLockUpgradableReadGuard::upgrade(current) = Arc::new(merged);

    trace!(class, merged = pending.len(), stamp = first.stamp, "consolidated pending coverage");
    pending.clear();
    pending.push(Arc::clone(&first));
    Ok(first)
}
