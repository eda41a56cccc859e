//! Segment store: an unordered bag of `[start, end]` segments with a payload.
//!
//! Segments are appended to the file as they are added; removals append a
//! tombstone. Memory holds an index of `(start, end, offset)` ordered by
//! start time, and payloads are read back from the file on query. The
//! longest segment seen bounds how far back an intersection query has to
//! look, so a point query only scans segments starting in
//! `[t - max_length, t]`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};
use super::codec::{self, RecordReader, RecordWriter};

pub const SEGMENT_MAGIC: &[u8; 4] = b"TGSG";
pub const SEGMENT_FORMAT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment<T> {
    pub start: i64,
    pub end: i64,
    pub payload: T,
}

impl<T> Segment<T> {
    pub fn new(start: i64, end: i64, payload: T) -> Self {
        Self { start, end, payload }
    }

    pub fn intersects(&self, start: i64, end: i64) -> bool {
        self.start <= end && start <= self.end
    }
}

/// Tombstone naming a segment by its start and insertion sequence.
#[derive(Serialize, Deserialize)]
struct RemovedRecord {
    start: i64,
    seq: u64,
}

#[derive(Serialize, Deserialize)]
struct CloseRecord {
    count: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    end: i64,
    offset: u64,
}

struct SegmentState {
    by_start: BTreeMap<(i64, u64), Entry>,
    next_seq: u64,
    max_length: u64,
    writer: Option<RecordWriter>,
    closed: bool,
}

impl SegmentState {
    fn insert(&mut self, start: i64, end: i64, offset: u64) {
        self.max_length = self.max_length.max(end.abs_diff(start));
        self.by_start.insert((start, self.next_seq), Entry { end, offset });
        self.next_seq += 1;
    }

    /// Keys of the segments overlapping `[start, end]`, ordered by start.
    fn overlapping(&self, start: i64, end: i64) -> Vec<((i64, u64), Entry)> {
        if end < start {
            return Vec::new();
        }
        let lowest = start.saturating_sub_unsigned(self.max_length);
        self.by_start
            .range((lowest, 0)..=(end, u64::MAX))
            .filter(|(_, e)| start <= e.end)
            .map(|(k, e)| (*k, *e))
            .collect()
    }

    fn writer(&mut self) -> Result<&mut RecordWriter> {
        match (self.closed, self.writer.as_mut()) {
            (false, Some(writer)) => Ok(writer),
            _ => Err(Error::InvariantViolation("segment store is closed for writing".into())),
        }
    }
}

/// File-backed segment store.
pub struct SegmentStore<T> {
    path: PathBuf,
    state: RwLock<SegmentState>,
    reader: RecordReader,
    _payload: PhantomData<fn() -> T>,
}

impl<T> SegmentStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Create a new, empty store file. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, provider_version: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer =
            RecordWriter::create(&path, SEGMENT_MAGIC, SEGMENT_FORMAT_VERSION, provider_version)?;
        let reader = RecordReader::open(&path)?;
        tracing::debug!(path = %path.display(), "segment store created");
        Ok(Self {
            path,
            state: RwLock::new(SegmentState {
                by_start: BTreeMap::new(),
                next_seq: 0,
                max_length: 0,
                writer: Some(writer),
                closed: false,
            }),
            reader,
            _payload: PhantomData,
        })
    }

    /// Reopen a finished store read-only, rebuilding only the index.
    pub fn open_existing(path: impl AsRef<Path>, provider_version: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = SegmentState {
            by_start: BTreeMap::new(),
            next_seq: 0,
            max_length: 0,
            writer: None,
            closed: true,
        };
        let mut close: Option<CloseRecord> = None;
        codec::scan(&path, SEGMENT_MAGIC, SEGMENT_FORMAT_VERSION, provider_version, |offset, kind, data| {
            if close.is_some() {
                return Err(Error::Corruption("record found after close record".into()));
            }
            match kind {
                codec::RECORD_SEGMENT => {
                    let segment: Segment<IgnoredAny> = codec::decode(data)?;
                    state.insert(segment.start, segment.end, offset);
                }
                codec::RECORD_SEGMENT_REMOVED => {
                    let rec: RemovedRecord = codec::decode(data)?;
                    if state.by_start.remove(&(rec.start, rec.seq)).is_none() {
                        return Err(Error::Corruption(format!(
                            "tombstone for unknown segment {} at {}", rec.seq, rec.start
                        )));
                    }
                }
                codec::RECORD_CLOSE => close = Some(codec::decode(data)?),
                other => {
                    return Err(Error::Corruption(format!("unknown record kind {other}")));
                }
            }
            Ok(())
        })?;
        let close = close.ok_or_else(|| {
            Error::Corruption(format!("segment store {} was never closed", path.display()))
        })?;
        if close.count != state.by_start.len() as u64 {
            return Err(Error::Corruption(format!(
                "segment store holds {} segments, close record says {}",
                state.by_start.len(), close.count
            )));
        }
        tracing::debug!(path = %path.display(), segments = close.count, "segment store reopened");
        let reader = RecordReader::open(&path)?;
        Ok(Self { path, state: RwLock::new(state), reader, _payload: PhantomData })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    pub fn len(&self) -> usize {
        self.state.read().by_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&self, segment: Segment<T>) -> Result<()> {
        if segment.end < segment.start {
            return Err(Error::TimeRange {
                time: segment.end,
                start: segment.start,
                end: segment.end,
            });
        }
        let mut state = self.state.write();
        let offset = state.writer()?.append(codec::RECORD_SEGMENT, &segment)?;
        state.insert(segment.start, segment.end, offset);
        Ok(())
    }

    /// Segments containing `t`.
    pub fn intersecting(&self, t: i64) -> Result<Vec<Segment<T>>> {
        self.intersecting_range(t, t)
    }

    /// Segments overlapping `[start, end]`, ordered by start time.
    pub fn intersecting_range(&self, start: i64, end: i64) -> Result<Vec<Segment<T>>> {
        let state = self.state.read();
        state
            .overlapping(start, end)
            .into_iter()
            .map(|(_, entry)| self.read(entry))
            .collect()
    }

    /// Remove every segment containing `t` that matches `pred`, returning
    /// how many went.
    pub fn remove_at(&self, t: i64, mut pred: impl FnMut(&Segment<T>) -> bool) -> Result<usize> {
        let mut state = self.state.write();
        state.writer()?;
        let mut removed = 0;
        for ((start, seq), entry) in state.overlapping(t, t) {
            if !pred(&self.read(entry)?) {
                continue;
            }
            state.writer()?.append(codec::RECORD_SEGMENT_REMOVED, &RemovedRecord { start, seq })?;
            state.by_start.remove(&(start, seq));
            removed += 1;
        }
        Ok(removed)
    }

    /// Finish the file and optionally delete it.
    pub fn close(&self, delete_file: bool) -> Result<()> {
        let mut state = self.state.write();
        let result = match state.writer.take() {
            Some(mut writer) => {
                let close = CloseRecord { count: state.by_start.len() as u64 };
                match writer.append(codec::RECORD_CLOSE, &close) {
                    Ok(_) => writer.finish(),
                    Err(e) => Err(e),
                }
            }
            None => Ok(()),
        };
        if !state.closed {
            tracing::debug!(path = %self.path.display(), segments = state.by_start.len(), "segment store closed");
        }
        state.closed = true;
        drop(state);
        if delete_file {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return result.and(Err(e.into())),
            }
        }
        result
    }

    fn read(&self, entry: Entry) -> Result<Segment<T>> {
        let segment: Segment<T> = self.reader.read_at(entry.offset, codec::RECORD_SEGMENT)?;
        if segment.end != entry.end {
            return Err(Error::Corruption(format!(
                "record at offset {} is not the indexed segment", entry.offset
            )));
        }
        Ok(segment)
    }
}

// ============================================================================
// Tests
// ============================================================================
