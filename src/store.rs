//! The per-process coverage store.
//!
//! A [`CoverageTable`] maps class identities to their pending snapshot
//! lists. [`CoverageStore`] owns a table behind a mutex: `&mut self`
//! methods reach the table without locking, and callers sharing a store
//! across threads acquire [`CoverageStore::lock`] around their own call
//! sequences.
//!
//! The store lock is not reentrant. While a thread holds the guard from
//! [`CoverageStore::lock`] it must work through that guard only: use
//! `guard.len()`, `guard.is_empty()`, `guard.clone()` for an in-transaction
//! shallow copy and `guard.merge(..)`. [`CoverageStore::shallow_copy`],
//! [`CoverageStore::merge`] (which locks its source) and the
//! [`Mergeable::is_empty`] impl lock on their own and would block forever on
//! a store the calling thread has already locked.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::matrix::CoverageMatrix;
use crate::snapshot::{consolidate, Snapshot, Stamp};
use crate::{Error, Result};

/// Resolves a class to its VM-internal name.
///
/// The name is the store key and is compared by exact equality. Any string,
/// the empty one included, is a valid name.
pub trait ClassDescriptor {
    /// Returns the VM-internal name, or `None` if the class cannot be
    /// identified.
    fn vm_name(&self) -> Option<&str>;
}

impl ClassDescriptor for str {
    fn vm_name(&self) -> Option<&str> {
        Some(self)
    }
}

impl ClassDescriptor for String {
    fn vm_name(&self) -> Option<&str> {
        Some(self)
    }
}

/// What [`CoverageTable::add_snapshot`] did with the new snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// The class had no coverage yet.
    Created,
    /// The snapshot matched the pending stamp and was queued for merging.
    Appended {
        /// Pending list length after the append.
        pending: usize,
    },
    /// The stamp differed; all pending snapshots were dropped.
    Replaced {
        /// Stamp of the dropped snapshots.
        previous_stamp: Stamp,
        /// How many snapshots were dropped.
        discarded: usize,
    },
}

/// Something that can absorb another value of its own kind.
pub trait Mergeable: Any {
    /// Returns `true` if merging `self` into something would change nothing.
    fn is_empty(&self) -> bool;

    /// Upcasts to `Any` for [`Mergeable::merge_dyn`].
    fn as_any(&self) -> &dyn Any;

    /// Folds `other` into `self` and returns `self`.
    fn merge(&mut self, other: &Self) -> &mut Self
    where
        Self: Sized;

    /// Like [`Mergeable::merge`] for a type-erased `other`.
    ///
    /// # Errors
    /// Returns a `TypeMismatch` if `other` is not a `Self`.
    fn merge_dyn(&mut self, other: &dyn Mergeable) -> Result<&mut Self>
    where
        Self: Sized,
    {
        match other.as_any().downcast_ref::<Self>() {
            Some(other) => Ok(self.merge(other)),
            None => Err(Error::TypeMismatch {
                expected: std::any::type_name::<Self>(),
            }),
        }
    }
}

/// Class identity to pending snapshot list.
///
/// Every list is non-empty and all of its snapshots carry the same stamp.
/// Cloning a table is shallow: the map and lists are new, the snapshots
/// are shared.
#[derive(Debug, Clone, Default)]
pub struct CoverageTable {
    classes: HashMap<String, Vec<Arc<Snapshot>>>,
}

impl CoverageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            classes: HashMap::with_capacity(capacity),
        }
    }

    /// Returns `true` if no class has coverage.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Number of distinct classes tracked.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Iterates over the tracked class names in map order.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    /// Number of snapshots waiting to be consolidated for `class`.
    pub fn pending_len(&self, class: &str) -> usize {
        self.classes.get(class).map_or(0, Vec::len)
    }

    /// Returns the merged snapshot for `class`.
    ///
    /// This is a mutating read: if several snapshots are pending they are
    /// merged into the first one and the list collapses to that single
    /// entry, so repeated reads do no further work.
    ///
    /// # Errors
    /// Returns a `StructuralMismatch` if the pending snapshots disagree on
    /// layout.
    pub fn get_coverage(&mut self, class: &str) -> Result<Option<Arc<Snapshot>>> {
        match self.classes.get_mut(class) {
            Some(pending) => consolidate(class, pending).map(Some),
            None => Ok(None),
        }
    }

    /// Resolves `cls` and returns its merged snapshot.
    ///
    /// # Errors
    /// Returns an `InvalidArgument` if `cls` has no VM name, otherwise as
    /// [`CoverageTable::get_coverage`].
    pub fn get_class_coverage<D>(&mut self, cls: &D) -> Result<Option<Arc<Snapshot>>>
    where
        D: ClassDescriptor + ?Sized,
    {
        let Some(name) = cls.vm_name() else {
            return Err(Error::InvalidArgument("class descriptor has no VM name".to_string()));
        };
        self.get_coverage(name)
    }

    /// Records a new observation for `class`.
    ///
    /// If the pending stamp differs from `stamp`, the whole pending list
    /// is discarded and replaced by this snapshot.
    pub fn add_snapshot(
        &mut self,
        class: impl Into<String>,
        matrix: CoverageMatrix,
        stamp: Stamp,
    ) -> Insertion {
        self.push(class.into(), Arc::new(Snapshot::new(matrix, stamp)))
    }

    /// Folds every pending snapshot of `other` into this table, in map
    /// order and then list order, with the same stamp policy as
    /// [`CoverageTable::add_snapshot`]. Snapshots are shared, not copied.
    pub fn merge(&mut self, other: &CoverageTable) -> &mut Self {
        for (class, pending) in &other.classes {
            for snapshot in pending {
                self.push(class.clone(), Arc::clone(snapshot));
            }
        }
        self
    }

    pub(crate) fn push(&mut self, class: String, snapshot: Arc<Snapshot>) -> Insertion {
        let stamp = snapshot.stamp();
        let Some(pending) = self.classes.get_mut(&class) else {
            self.classes.insert(class, vec![snapshot]);
            return Insertion::Created;
        };

        match pending.first().map(|s| s.stamp()) {
            Some(previous_stamp) if previous_stamp != stamp => {
                let discarded = pending.len();
                warn!(
                    class = %class,
                    previous_stamp,
                    stamp,
                    discarded,
                    "class version changed, discarding earlier coverage"
                );
                pending.clear();
                pending.push(snapshot);
                Insertion::Replaced {
                    previous_stamp,
                    discarded,
                }
            }
            _ => {
                pending.push(snapshot);
                Insertion::Appended {
                    pending: pending.len(),
                }
            }
        }
    }

    /// Replaces the entry for `class` with a single snapshot.
    pub(crate) fn insert_decoded(&mut self, class: String, snapshot: Snapshot) -> bool {
        self.classes
            .insert(class, vec![Arc::new(snapshot)])
            .is_some()
    }

    /// Consolidates every class, in map order, and returns the merged
    /// snapshots. Stops at the first layout mismatch.
    pub(crate) fn consolidated(&mut self) -> Result<Vec<(&str, Arc<Snapshot>)>> {
        self.classes
            .iter_mut()
            .map(|(class, pending)| Ok((class.as_str(), consolidate(class, pending)?)))
            .collect()
    }
}

/// The coverage store: a [`CoverageTable`] guarded by a mutex.
#[derive(Default)]
pub struct CoverageStore {
    table: Mutex<CoverageTable>,
}

impl CoverageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing table.
    pub fn from_table(table: CoverageTable) -> Self {
        Self {
            table: Mutex::new(table),
        }
    }

    /// Acquires the store lock.
    ///
    /// Hold the guard across any sequence of calls that must appear atomic
    /// to other threads sharing this store. The lock is not reentrant: call
    /// no other `&self` method of this store until the guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, CoverageTable> {
        self.table.lock()
    }

    /// Direct access to the table through an exclusive borrow.
    pub fn table_mut(&mut self) -> &mut CoverageTable {
        self.table.get_mut()
    }

    /// Unwraps the store into its table.
    pub fn into_table(self) -> CoverageTable {
        self.table.into_inner()
    }

    /// Returns `true` if no class has coverage. Under a shared store, use
    /// the guard's `is_empty` instead.
    pub fn is_empty(&mut self) -> bool {
        self.table.get_mut().is_empty()
    }

    /// Number of distinct classes tracked. Under a shared store, use the
    /// guard's `len` instead.
    pub fn len(&mut self) -> usize {
        self.table.get_mut().len()
    }

    /// See [`CoverageTable::get_coverage`].
    pub fn get_coverage(&mut self, class: &str) -> Result<Option<Arc<Snapshot>>> {
        self.table.get_mut().get_coverage(class)
    }

    /// See [`CoverageTable::get_class_coverage`].
    pub fn get_class_coverage<D>(&mut self, cls: &D) -> Result<Option<Arc<Snapshot>>>
    where
        D: ClassDescriptor + ?Sized,
    {
        self.table.get_mut().get_class_coverage(cls)
    }

    /// See [`CoverageTable::add_snapshot`].
    pub fn add_snapshot(
        &mut self,
        class: impl Into<String>,
        matrix: CoverageMatrix,
        stamp: Stamp,
    ) -> Insertion {
        self.table.get_mut().add_snapshot(class, matrix, stamp)
    }

    /// Folds every pending snapshot of `other` into this store.
    ///
    /// Empty sources are a no-op; merging a store into itself cannot be
    /// expressed through the exclusive borrow. `other` is locked only while
    /// it is read, so the calling thread must not hold `other.lock()`; with
    /// that guard in hand, use `self.table_mut().merge(&guard)`.
    pub fn merge(&mut self, other: &CoverageStore) -> &mut Self {
        let other = other.table.lock();
        if !other.is_empty() {
            self.table.get_mut().merge(&other);
        }
        self
    }

    /// Copies the top-level map under the lock.
    ///
    /// The copy owns its map and lists; the snapshots inside are shared
    /// with `self`, so consolidation on either side is visible to both.
    /// Inside a transaction, clone the guard's table instead:
    /// `CoverageStore::from(guard.clone())`.
    pub fn shallow_copy(&self) -> CoverageStore {
        let table = self.table.lock().clone();
        CoverageStore::from_table(table)
    }
}

impl Mergeable for CoverageStore {
    /// Locks the store for the check.
    fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn merge(&mut self, other: &Self) -> &mut Self {
        CoverageStore::merge(self, other)
    }
}

impl Clone for CoverageStore {
    fn clone(&self) -> Self {
        self.shallow_copy()
    }
}

impl From<CoverageTable> for CoverageStore {
    fn from(table: CoverageTable) -> Self {
        Self::from_table(table)
    }
}

impl fmt::Debug for CoverageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoverageStore")
            .field("table", &*self.table.lock())
            .finish()
    }
}
