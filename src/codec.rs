//! Binary encoding of coverage tables.
//!
//! All integers are big-endian. The layout is:
//!
//! ```text
//! class_count: i32
//! repeated class_count times:
//!     class_name: u16 byte length + modified UTF-8
//!     stamp:      i64
//!     row_count:  i32
//!     rows:       row_count rows in the row codec's format
//! ```
//!
//! Keys are written in the table's own iteration order, so two tables with
//! the same content are not guaranteed to produce identical bytes.

use std::io::{self, Read, Write};

use tracing::debug;

use crate::matrix::CoverageMatrix;
use crate::snapshot::Snapshot;
use crate::store::CoverageTable;
use crate::{consts, Error, Result};

/// Reads and writes a single, possibly absent, matrix row.
///
/// Implementations must distinguish an absent row from an empty one.
pub trait RowCodec {
    fn write_row<W: Write + ?Sized>(&self, writer: &mut W, row: Option<&[bool]>) -> Result<()>;

    fn read_row<R: Read + ?Sized>(&self, reader: &mut R) -> Result<Option<Vec<bool>>>;
}

/// The default row format: an `i32` length, `-1` for an absent row,
/// followed by one byte per probe. Any non-zero byte reads as `true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataRowCodec;

impl RowCodec for DataRowCodec {
    fn write_row<W: Write + ?Sized>(&self, writer: &mut W, row: Option<&[bool]>) -> Result<()> {
        let Some(row) = row else {
            return write_i32(writer, consts::ABSENT_ROW);
        };
        write_i32(writer, encode_len(row.len(), "row length")?)?;
        let bytes: Vec<u8> = row.iter().map(|&hit| u8::from(hit)).collect();
        writer.write_all(&bytes)?;
        Ok(())
    }

    fn read_row<R: Read + ?Sized>(&self, reader: &mut R) -> Result<Option<Vec<bool>>> {
        let len = read_i32(reader)?;
        if len == consts::ABSENT_ROW {
            return Ok(None);
        }
        let len = decode_len(len, "row length")?;
        let bytes = read_bytes(reader, len)?;
        Ok(Some(bytes.into_iter().map(|b| b != 0).collect()))
    }
}

/// Encodes and decodes whole coverage tables.
#[derive(Debug, Clone, Default)]
pub struct CoverageCodec<C = DataRowCodec> {
    rows: C,
}

impl<C: RowCodec> CoverageCodec<C> {
    /// Creates a codec using `rows` for matrix rows.
    pub fn new(rows: C) -> Self {
        Self { rows }
    }

    /// Writes `table`, consolidating each class's pending snapshots first.
    ///
    /// Every class is consolidated before the first byte is written, so a
    /// layout mismatch leaves `writer` untouched.
    ///
    /// # Errors
    /// Fails on write errors, on values the format cannot represent, and if
    /// a consolidation hits a layout mismatch.
    pub fn encode<W: Write + ?Sized>(&self, table: &mut CoverageTable, writer: &mut W) -> Result<()> {
        let entries = table.consolidated()?;
        write_i32(writer, encode_len(entries.len(), "class count")?)?;
        for (class, snapshot) in &entries {
            write_utf(writer, class)?;
            write_i64(writer, snapshot.stamp())?;
            let matrix = snapshot.matrix();
            write_i32(writer, encode_len(matrix.row_count(), "row count")?)?;
            for row in matrix.rows() {
                self.rows.write_row(writer, row)?;
            }
        }
        debug!(classes = entries.len(), "encoded coverage table");
        Ok(())
    }

    /// Reads a table, one snapshot per class.
    ///
    /// # Errors
    /// Returns a `MalformedStream` if the input is truncated or holds
    /// invalid counts or strings. No partial table is returned.
    pub fn decode<R: Read + ?Sized>(&self, reader: &mut R) -> Result<CoverageTable> {
        let count = decode_len(read_i32(reader)?, "class count")?;
        let mut table = CoverageTable::with_capacity(count.min(consts::MAX_PREALLOCATED_CLASSES));

        for _ in 0..count {
            let class = read_utf(reader)?;
            let stamp = read_i64(reader)?;
            let row_count = decode_len(read_i32(reader)?, "row count")?;
            let mut rows = Vec::with_capacity(row_count.min(consts::MAX_PREALLOCATED_ROWS));
            for _ in 0..row_count {
                rows.push(self.rows.read_row(reader)?);
            }
            let snapshot = Snapshot::new(CoverageMatrix::new(rows), stamp);
            if table.insert_decoded(class.clone(), snapshot) {
                debug!(class = %class, "duplicate class in stream, keeping the later record");
            }
        }

        debug!(classes = table.len(), "decoded coverage table");
        Ok(table)
    }
}

fn encode_len(len: usize, what: &str) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::Encoding(format!("{what} {len} exceeds i32::MAX")))
}

fn decode_len(len: i32, what: &str) -> Result<usize> {
    usize::try_from(len).map_err(|_| Error::MalformedStream(format!("negative {what}: {len}")))
}

fn read_exact<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            Error::MalformedStream("unexpected end of stream".to_string())
        }
        _ => Error::Io(e),
    })
}

/// Reads exactly `len` bytes without trusting `len` for the allocation.
fn read_bytes<R: Read + ?Sized>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(len.min(consts::MAX_PREALLOCATED_BYTES));
    Read::take(&mut *reader, len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(Error::MalformedStream(format!(
            "expected {len} bytes, found {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn write_i32<W: Write + ?Sized>(writer: &mut W, value: i32) -> Result<()> {
    writer.write_all(&value.to_be_bytes())?;
    Ok(())
}

fn write_i64<W: Write + ?Sized>(writer: &mut W, value: i64) -> Result<()> {
    writer.write_all(&value.to_be_bytes())?;
    Ok(())
}

fn read_i32<R: Read + ?Sized>(reader: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_i64<R: Read + ?Sized>(reader: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

/// Writes `s` as a `u16` byte length followed by modified UTF-8: NUL is
/// two bytes and supplementary characters are encoded as surrogate pairs.
fn write_utf<W: Write + ?Sized>(writer: &mut W, s: &str) -> Result<()> {
    let mut bytes = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => bytes.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                bytes.push(0xC0 | (unit >> 6) as u8);
                bytes.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                bytes.push(0xE0 | (unit >> 12) as u8);
                bytes.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                bytes.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    let len = u16::try_from(bytes.len()).map_err(|_| {
        Error::Encoding(format!("class name of {} encoded bytes is too long", bytes.len()))
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&bytes)?;
    Ok(())
}

fn read_utf<R: Read + ?Sized>(reader: &mut R) -> Result<String> {
    let mut len = [0u8; 2];
    read_exact(reader, &mut len)?;
    let bytes = read_bytes(reader, usize::from(u16::from_be_bytes(len)))?;

    let malformed = |at: usize| Error::MalformedStream(format!("malformed modified UTF-8 at byte {at}"));
    let continuation = |at: usize| -> Result<u16> {
        match bytes.get(at) {
            Some(&b) if b & 0xC0 == 0x80 => Ok(u16::from(b & 0x3F)),
            _ => Err(malformed(at)),
        }
    };

    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b >> 4 {
            0x0..=0x7 => {
                units.push(u16::from(b));
                i += 1;
            }
            0xC | 0xD => {
                units.push((u16::from(b & 0x1F) << 6) | continuation(i + 1)?);
                i += 2;
            }
            0xE => {
                units.push(
                    (u16::from(b & 0x0F) << 12) | (continuation(i + 1)? << 6) | continuation(i + 2)?,
                );
                i += 3;
            }
            _ => return Err(malformed(i)),
        }
    }

    String::from_utf16(&units)
        .map_err(|_| Error::MalformedStream("class name is not valid UTF-16".to_string()))
}
