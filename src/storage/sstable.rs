//! Immutable sorted runs on disk
//!
//! Layout of a run file:
//!
//! ```text
//! [ROW]*  [OFFSET:8]*  [ROW_COUNT:8][INDEX_OFFSET:8][INDEX_CRC32:4][MAGIC:4]
//!
//! ROW = [KEY_LEN:4][KEY][TIMESTAMP:8] ( [VALUE_LEN:8][VALUE] if TIMESTAMP > 0 )
//! ```
//!
//! All integers are little-endian. Offsets point at the start of each row, in
//! key order, so a lookup is a binary search over the offset table. A run is
//! written to a `.tmp` file, fsynced and renamed; a crash never leaves a
//! half-written run under its final name.

use crate::common::{crc32, Error, Result};
use crate::storage::cell::{Cell, Row};
use crate::storage::table::{RowIter, SortedTable};
use bytes::Bytes;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const RUN_MAGIC: [u8; 4] = [0x52, 0x55, 0x4E, 0x31]; // "RUN1"
const FOOTER_LEN: u64 = 8 + 8 + 4 + 4;

pub const RUN_PREFIX: &str = "run-";
pub const RUN_EXTENSION: &str = "sst";
pub const TMP_EXTENSION: &str = "tmp";

/// An immutable, sorted, indexed file of rows.
#[derive(Debug)]
pub struct SortedRun {
    path: PathBuf,
    generation: u64,
    offsets: Arc<[u64]>,
    data_len: u64,
}

impl SortedRun {
    /// File name of the run with the given generation.
    pub fn file_name(generation: u64) -> String {
        format!("{}{:020}.{}", RUN_PREFIX, generation, RUN_EXTENSION)
    }

    /// Generation encoded in a run file name, if it is one.
    pub fn parse_generation(file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix(RUN_PREFIX)?
            .strip_suffix(RUN_EXTENSION)?
            .strip_suffix('.')?
            .parse()
            .ok()
    }

    /// Write `rows` (ascending, unique keys) as a new run at `path`.
    ///
    /// Returns `None` without leaving a file behind when `rows` is empty.
    pub fn write(
        path: &Path,
        generation: u64,
        rows: impl Iterator<Item = Result<Row>>,
    ) -> Result<Option<SortedRun>> {
        let tmp_path = path.with_extension(TMP_EXTENSION);
        match Self::write_tmp(&tmp_path, rows) {
            Ok(Some((offsets, data_len))) => {
                fs::rename(&tmp_path, path)?;
                sync_parent(path);
                Ok(Some(SortedRun {
                    path: path.to_path_buf(),
                    generation,
                    offsets: offsets.into(),
                    data_len,
                }))
            }
            Ok(None) => {
                fs::remove_file(&tmp_path)?;
                Ok(None)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn write_tmp(
        tmp_path: &Path,
        rows: impl Iterator<Item = Result<Row>>,
    ) -> Result<Option<(Vec<u64>, u64)>> {
        let file = File::create(tmp_path)?;
        let mut writer = BufWriter::new(file);
        let mut offsets = Vec::new();
        let mut position = 0u64;

        for row in rows {
            let row = row?;
            offsets.push(position);
            position += write_row(&mut writer, &row)?;
        }

        if offsets.is_empty() {
            return Ok(None);
        }

        let mut index = Vec::with_capacity(offsets.len() * 8);
        for offset in &offsets {
            index.extend_from_slice(&offset.to_le_bytes());
        }
        writer.write_all(&index)?;

        // Footer
        writer.write_all(&(offsets.len() as u64).to_le_bytes())?;
        writer.write_all(&position.to_le_bytes())?;
        writer.write_all(&crc32(&index).to_le_bytes())?;
        writer.write_all(&RUN_MAGIC)?;

        writer.flush()?;
        writer.get_ref().sync_all()?;

        Ok(Some((offsets, position)))
    }

    /// Open an existing run, verifying its footer and index checksum.
    pub fn open(path: &Path, generation: u64) -> Result<SortedRun> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_LEN {
            return Err(Error::Corrupted(format!(
                "{} is too short to be a sorted run",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(file_len - FOOTER_LEN))?;
        let mut footer = [0u8; FOOTER_LEN as usize];
        file.read_exact(&mut footer)?;

        if footer[20..24] != RUN_MAGIC {
            return Err(Error::Corrupted(format!(
                "invalid run magic in {}",
                path.display()
            )));
        }
        let row_count = u64::from_le_bytes(le_bytes(&footer[0..8]));
        let data_len = u64::from_le_bytes(le_bytes(&footer[8..16]));
        let stored_checksum = u32::from_le_bytes(le_bytes(&footer[16..20]));

        let index_len = row_count
            .checked_mul(8)
            .filter(|len| data_len.checked_add(*len) == Some(file_len - FOOTER_LEN))
            .ok_or_else(|| {
                Error::Corrupted(format!("inconsistent footer in {}", path.display()))
            })?;

        file.seek(SeekFrom::Start(data_len))?;
        let mut index = vec![0u8; index_len as usize];
        file.read_exact(&mut index)?;

        let computed_checksum = crc32(&index);
        if computed_checksum != stored_checksum {
            return Err(Error::ChecksumMismatch {
                expected: stored_checksum,
                actual: computed_checksum,
            });
        }

        let offsets: Vec<u64> = index
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(le_bytes(chunk)))
            .collect();
        if offsets.iter().any(|offset| *offset >= data_len) {
            return Err(Error::Corrupted(format!(
                "row offset out of bounds in {}",
                path.display()
            )));
        }

        Ok(SortedRun {
            path: path.to_path_buf(),
            generation,
            offsets: offsets.into(),
            data_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Index of the first row whose key is `>= from`.
    fn seek_index(&self, file: &mut File, from: &[u8]) -> Result<usize> {
        let (mut lo, mut hi) = (0, self.offsets.len());
        if from.is_empty() {
            return Ok(0);
        }
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let key = read_key_at(file, self.offsets[mid], self.data_len)?;
            if key.as_slice() < from {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

impl SortedTable for SortedRun {
    fn iter_from(&self, from: &[u8]) -> Result<RowIter> {
        let mut file = File::open(&self.path)?;
        let start = self.seek_index(&mut file, from)?;
        let remaining = self.offsets.len() - start;
        if remaining > 0 {
            file.seek(SeekFrom::Start(self.offsets[start]))?;
        }
        Ok(Box::new(RunIter {
            reader: BufReader::new(file),
            remaining,
            generation: self.generation,
            data_len: self.data_len,
        }))
    }

    fn size_in_bytes(&self) -> u64 {
        self.data_len
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

/// Sequential reader over a run, owning its own file handle.
struct RunIter {
    reader: BufReader<File>,
    remaining: usize,
    generation: u64,
    data_len: u64,
}

impl Iterator for RunIter {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match read_row(&mut self.reader, self.generation, self.data_len) {
            Ok(row) => Some(Ok(row)),
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

fn write_row<W: Write>(writer: &mut W, row: &Row) -> Result<u64> {
    let key_len = u32::try_from(row.key.len())
        .map_err(|_| Error::InvalidKey(format!("key of {} bytes", row.key.len())))?;
    writer.write_all(&key_len.to_le_bytes())?;
    writer.write_all(&row.key)?;
    writer.write_all(&row.cell.signed_timestamp().to_le_bytes())?;
    if let Some(value) = row.cell.value() {
        writer.write_all(&(value.len() as u64).to_le_bytes())?;
        writer.write_all(value)?;
    }
    Ok(row.flushed_size())
}

fn read_row<R: Read>(reader: &mut R, generation: u64, data_len: u64) -> Result<Row> {
    let key = read_key(reader, data_len)?;

    let mut ts_bytes = [0u8; 8];
    reader.read_exact(&mut ts_bytes)?;
    let timestamp = i64::from_le_bytes(ts_bytes);

    let value = if timestamp > 0 {
        let mut len_bytes = [0u8; 8];
        reader.read_exact(&mut len_bytes)?;
        let len = checked_len(u64::from_le_bytes(len_bytes), data_len)?;
        let mut value = vec![0u8; len];
        reader.read_exact(&mut value)?;
        Bytes::from(value)
    } else {
        Bytes::new()
    };

    Ok(Row::new(
        Bytes::from(key),
        Cell::from_signed(timestamp, value)?,
        generation,
    ))
}

fn read_key<R: Read>(reader: &mut R, data_len: u64) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = checked_len(u32::from_le_bytes(len_bytes) as u64, data_len)?;
    let mut key = vec![0u8; len];
    reader.read_exact(&mut key)?;
    Ok(key)
}

fn read_key_at(file: &mut File, offset: u64, data_len: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    read_key(file, data_len)
}

fn checked_len(len: u64, data_len: u64) -> Result<usize> {
    if len > data_len {
        return Err(Error::Corrupted(format!(
            "length {} exceeds run data size {}",
            len, data_len
        )));
    }
    Ok(len as usize)
}

fn le_bytes<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(slice);
    bytes
}

/// Best effort: make the rename durable.
fn sync_parent(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
        tracing::warn!("Failed to sync directory {}: {}", parent.display(), e);
    }
}
