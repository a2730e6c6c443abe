//! # covstore
//!
//! A self-contained Rust library for accumulating per-class probe coverage,
//! merging repeated observations of the same class, and persisting the
//! result in a compact binary format so separate runs can be combined
//! offline.
//!
//! Coverage for a class is recorded as a [`CoverageMatrix`] captured against
//! a [`Stamp`] identifying the compiled version of that class. Observations
//! with equal stamps are ORed together lazily, the first time the merged
//! view is read. An observation with a new stamp replaces everything
//! recorded for the older version.
//!
//! ## Example Usage
//!
//! ```no_run
//! use covstore::{CoverageMatrix, CoverageStore};
//!
//! let mut store = CoverageStore::new();
//! store.add_snapshot("com/acme/Foo", CoverageMatrix::builder().row([true, false]).build(), 100);
//! store.add_snapshot("com/acme/Foo", CoverageMatrix::builder().row([false, true]).build(), 100);
//!
//! let merged = store.get_coverage("com/acme/Foo").unwrap().unwrap();
//! assert_eq!(merged.matrix().row(0), Some(&[true, true][..]));
//!
//! // Persist, then fold another run's file into this one.
//! covstore::to_file(&mut store, "run1.cov").unwrap();
//! let other = covstore::from_file("run2.cov").unwrap();
//! store.merge(&other);
//! ```

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use tempfile::NamedTempFile;

mod codec;
mod matrix;
mod snapshot;
mod store;

pub use codec::{CoverageCodec, DataRowCodec, RowCodec};
pub use matrix::{CoverageMatrix, MatrixBuilder, ProbeState};
pub use snapshot::{Snapshot, Stamp};
pub use store::{ClassDescriptor, CoverageStore, CoverageTable, Insertion, Mergeable};

/// A specialized `Result` type for covstore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur while storing or serializing coverage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The input stream is truncated or inconsistent.
    #[error("Malformed stream: {0}")]
    MalformedStream(String),
    /// A lookup was given an absent class identity.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Two snapshots with the same stamp have different layouts.
    #[error("Structural mismatch in '{class}': {detail}")]
    StructuralMismatch { class: String, detail: String },
    /// A merge was handed a value of a different concrete type.
    #[error("Type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },
    /// A value cannot be represented in the binary format.
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Constants used throughout the library.
mod consts {
    /// Row length marker for an uninstrumented row.
    pub(crate) const ABSENT_ROW: i32 = -1;
    // Upper bounds on capacity reserved from declared counts while decoding.
    pub(crate) const MAX_PREALLOCATED_CLASSES: usize = 4096;
    pub(crate) const MAX_PREALLOCATED_ROWS: usize = 1024;
    pub(crate) const MAX_PREALLOCATED_BYTES: usize = 64 * 1024;
}

/// Reads a coverage store from a file path.
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<CoverageStore> {
    from_reader(File::open(path)?)
}

/// Reads a coverage store from any reader.
pub fn from_reader<R: Read>(reader: R) -> Result<CoverageStore> {
    let mut reader = BufReader::new(reader);
    let table = CoverageCodec::new(DataRowCodec).decode(&mut reader)?;
    Ok(CoverageStore::from_table(table))
}

/// Reads a coverage store from a byte slice.
pub fn from_bytes(bytes: &[u8]) -> Result<CoverageStore> {
    let mut bytes = bytes;
    let table = CoverageCodec::new(DataRowCodec).decode(&mut bytes)?;
    Ok(CoverageStore::from_table(table))
}

/// Writes a coverage store to a file path.
///
/// Pending snapshots are consolidated before anything is written. The data
/// goes to a temporary file next to `path`, which then replaces `path`, so
/// an existing file is left as it was if encoding fails.
pub fn to_file<P: AsRef<Path>>(store: &mut CoverageStore, path: P) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        to_writer(store, &mut writer)?;
        writer.flush()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Writes a coverage store to any writer.
pub fn to_writer<W: Write>(store: &mut CoverageStore, writer: &mut W) -> Result<()> {
    CoverageCodec::new(DataRowCodec).encode(store.table_mut(), writer)
}

/// Encodes a coverage store into a new buffer.
pub fn to_bytes(store: &mut CoverageStore) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    to_writer(store, &mut buffer)?;
    Ok(buffer)
}
