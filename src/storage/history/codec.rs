//! Versioned, checksummed record format shared by both store files.
//!
//! ```text
//! header : magic[4] | format_version u32 | provider_version u32
//! record : kind u8  | len u32 | json payload[len] | crc32(payload) u32
//! ```
//!
//! All integers are little-endian. Stores append records as they happen
//! and read them back by offset. A store file is complete only when its
//! last record is of kind [`RECORD_CLOSE`].

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Error, Result};

pub const RECORD_ATTRIBUTE: u8 = 1;
pub const RECORD_INTERVAL: u8 = 2;
pub const RECORD_SEGMENT: u8 = 3;
pub const RECORD_REVERT: u8 = 4;
pub const RECORD_SEGMENT_REMOVED: u8 = 5;
pub const RECORD_CLOSE: u8 = 0xFF;

/// Size of the file header in bytes.
pub const HEADER_LEN: u64 = 12;

/// Payloads larger than this are treated as corruption, not allocated.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

pub fn write_header(
    w: &mut impl Write,
    magic: &[u8; 4],
    format_version: u32,
    provider_version: u32,
) -> Result<()> {
    w.write_all(magic)?;
    w.write_all(&format_version.to_le_bytes())?;
    w.write_all(&provider_version.to_le_bytes())?;
    Ok(())
}

/// Check magic and both versions. A mismatch is a `VersionMismatch`, a bad
/// magic or a short header is `Corruption`.
pub fn read_header(
    r: &mut impl Read,
    magic: &[u8; 4],
    format_version: u32,
    provider_version: u32,
) -> Result<()> {
    let mut found_magic = [0u8; 4];
    read_exact_or_corrupt(r, &mut found_magic, "header magic")?;
    if &found_magic != magic {
        return Err(Error::Corruption(format!(
            "bad magic {:?}, expected {:?}",
            String::from_utf8_lossy(&found_magic),
            String::from_utf8_lossy(magic),
        )));
    }
    let found_format = read_u32(r, "format version")?;
    if found_format != format_version {
        return Err(Error::VersionMismatch { expected: format_version, found: found_format });
    }
    let found_provider = read_u32(r, "provider version")?;
    if found_provider != provider_version {
        return Err(Error::VersionMismatch { expected: provider_version, found: found_provider });
    }
    Ok(())
}

/// Write one record, returning its size in bytes.
pub fn write_record<T: Serialize>(w: &mut impl Write, kind: u8, payload: &T) -> Result<u64> {
    let data = serde_json::to_vec(payload)?;
    let len = u32::try_from(data.len())
        .ok()
        .filter(|len| *len <= MAX_RECORD_LEN)
        .ok_or_else(|| Error::StorageError(format!("record of {} bytes is too large", data.len())))?;
    let crc = crc32fast::hash(&data);
    w.write_all(&[kind])?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&data)?;
    w.write_all(&crc.to_le_bytes())?;
    Ok(record_len(data.len()))
}

fn record_len(payload_len: usize) -> u64 {
    1 + 4 + payload_len as u64 + 4
}

/// Read the next record. `Ok(None)` at a clean end of file.
pub fn read_record(r: &mut impl Read) -> Result<Option<(u8, Vec<u8>)>> {
    let mut kind = [0u8; 1];
    match r.read_exact(&mut kind) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = read_u32(r, "record length")?;
    if len > MAX_RECORD_LEN {
        return Err(Error::Corruption(format!("record length {len} out of bounds")));
    }
    let mut data = vec![0u8; len as usize];
    read_exact_or_corrupt(r, &mut data, "record payload")?;
    let stored = read_u32(r, "record checksum")?;
    let computed = crc32fast::hash(&data);
    if stored != computed {
        return Err(Error::Corruption(format!(
            "checksum mismatch on record kind {}: stored {stored:#010x}, computed {computed:#010x}",
            kind[0]
        )));
    }
    Ok(Some((kind[0], data)))
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

/// Read every record after the header, handing each to `visit` together
/// with its offset in the file.
pub fn scan(
    path: &Path,
    magic: &[u8; 4],
    format_version: u32,
    provider_version: u32,
    mut visit: impl FnMut(u64, u8, &[u8]) -> Result<()>,
) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    read_header(&mut reader, magic, format_version, provider_version)?;
    let mut offset = HEADER_LEN;
    while let Some((kind, data)) = read_record(&mut reader)? {
        visit(offset, kind, &data)?;
        offset += record_len(data.len());
    }
    Ok(())
}

// ============================================================================
// Append and random access
// ============================================================================

/// Append side of a store file. Each record is flushed once written, so a
/// [`RecordReader`] on the same path can read it back right away.
pub struct RecordWriter {
    inner: BufWriter<File>,
    offset: u64,
}

impl RecordWriter {
    /// Create `path` with its header. Fails if the file already exists.
    pub fn create(
        path: &Path,
        magic: &[u8; 4],
        format_version: u32,
        provider_version: u32,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => {
                    Error::StorageError(format!("{} already exists", path.display()))
                }
                _ => Error::Io(e),
            })?;
        let mut inner = BufWriter::new(file);
        write_header(&mut inner, magic, format_version, provider_version)?;
        inner.flush()?;
        Ok(Self { inner, offset: HEADER_LEN })
    }

    /// Append a record and return the offset it starts at.
    pub fn append<T: Serialize>(&mut self, kind: u8, payload: &T) -> Result<u64> {
        let at = self.offset;
        let written = write_record(&mut self.inner, kind, payload)?;
        self.inner.flush()?;
        self.offset += written;
        Ok(at)
    }

    /// Flush and sync. The file is not touched again.
    pub fn finish(mut self) -> Result<()> {
        self.inner.flush()?;
        self.inner.get_ref().sync_all()?;
        Ok(())
    }
}

/// Reads single records of a store file by offset.
pub struct RecordReader {
    file: Mutex<File>,
}

impl RecordReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { file: Mutex::new(File::open(path)?) })
    }

    /// Decode the record at `offset`, which must be of kind `kind`.
    pub fn read_at<T: DeserializeOwned>(&self, offset: u64, kind: u8) -> Result<T> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let (found, data) = read_record(&mut BufReader::new(&mut *file))?
            .ok_or_else(|| Error::Corruption(format!("no record at offset {offset}")))?;
        if found != kind {
            return Err(Error::Corruption(format!(
                "record at offset {offset} is of kind {found}, expected {kind}"
            )));
        }
        decode(&data)
    }
}

fn read_u32(r: &mut impl Read, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact_or_corrupt(r, &mut buf, what)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_exact_or_corrupt(r: &mut impl Read, buf: &mut [u8], what: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::Corruption(format!("truncated {what}")),
        _ => Error::Io(e),
    })
}
