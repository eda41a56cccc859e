//! Interval store ("state history").
//!
//! One column per attribute. Each column is a contiguous run of closed
//! `[start, end]` intervals starting at the store's start time, followed by
//! one ongoing interval whose end is the store's current end time. Writes
//! come from a single writer in non-decreasing time per attribute; readers
//! query concurrently through the same `RwLock`.
//!
//! A closed interval is appended to the file the moment it closes. Memory
//! holds the ongoing interval of each column and, per closed interval, its
//! span and file offset; values are read back from the file on query.
//!
//! ```text
//! ATTRIBUTE  attribute declared, or its metadata replaced
//! INTERVAL   interval closed; a span already in the column is replaced
//! REVERT     the column's last closed interval is reopened
//! CLOSE      start and end time; the file is complete
//! ```
//!
//! A file without a close record was never finished and is refused on
//! reopen.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};

use crate::model::Attribute;
use crate::storage::BuildLatch;
use crate::{Error, Result};
use super::codec::{self, RecordReader, RecordWriter};

pub const HISTORY_MAGIC: &[u8; 4] = b"TGHT";
pub const HISTORY_FORMAT_VERSION: u32 = 2;

/// A `[start, end]` span of one attribute holding one value.
/// `None` is the null value of an attribute nothing was written to yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval<V> {
    pub attribute: Attribute,
    pub start: i64,
    pub end: i64,
    pub value: Option<V>,
}

impl<V> Interval<V> {
    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Where an interval sits, without its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: i64,
    pub end: i64,
    pub has_value: bool,
}

#[derive(Debug, Clone)]
struct Ongoing<V> {
    start: i64,
    value: Option<V>,
}

/// Index entry of a closed interval whose value lives in the file.
#[derive(Debug, Clone, Copy)]
struct Closed {
    start: i64,
    end: i64,
    has_value: bool,
    offset: u64,
}

impl Closed {
    fn span(&self) -> Span {
        Span { start: self.start, end: self.end, has_value: self.has_value }
    }
}

#[derive(Debug)]
struct Column<V> {
    closed: Vec<Closed>,
    ongoing: Option<Ongoing<V>>,
}

impl<V> Column<V> {
    /// Index of the closed interval covering `t`.
    fn closed_at(&self, t: i64) -> Option<usize> {
        let idx = self.closed.partition_point(|c| c.end < t);
        self.closed.get(idx).filter(|c| c.start <= t).map(|_| idx)
    }

    /// Index a closed interval: either the next one in time, or a new
    /// version of one already indexed.
    fn index(&mut self, attribute: Attribute, entry: Closed) -> Result<()> {
        if entry.end < entry.start {
            return Err(Error::Corruption(format!(
                "interval [{}, {}] of attribute {attribute} ends before it starts",
                entry.start, entry.end
            )));
        }
        if let Some(idx) = self.closed_at(entry.start) {
            let existing = &mut self.closed[idx];
            if existing.start != entry.start || existing.end != entry.end {
                return Err(Error::Corruption(format!(
                    "interval [{}, {}] of attribute {attribute} overlaps [{}, {}]",
                    entry.start, entry.end, existing.start, existing.end
                )));
            }
            *existing = entry;
            return Ok(());
        }
        if self.closed.last().is_some_and(|last| last.end.checked_add(1) != Some(entry.start)) {
            return Err(Error::Corruption(format!(
                "interval [{}, {}] of attribute {attribute} breaks the column",
                entry.start, entry.end
            )));
        }
        self.closed.push(entry);
        Ok(())
    }
}

struct HistoryState<V> {
    start_time: i64,
    current_end: i64,
    names: Vec<String>,
    by_name: HashMap<String, Attribute>,
    metadata: Vec<Option<serde_json::Value>>,
    columns: Vec<Column<V>>,
    /// Attributes whose declaration is already in the file.
    declared: usize,
    writer: Option<RecordWriter>,
    closed: bool,
}

#[derive(Serialize, Deserialize)]
struct AttributeRecord {
    attribute: Attribute,
    name: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
struct RevertRecord {
    attribute: Attribute,
}

#[derive(Serialize, Deserialize)]
struct CloseRecord {
    start_time: i64,
    end_time: i64,
}

/// File-backed interval store.
pub struct IntervalStore<V> {
    path: PathBuf,
    provider_version: u32,
    state: RwLock<HistoryState<V>>,
    reader: RecordReader,
    built: BuildLatch,
}

impl<V> IntervalStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Create a new, empty store file. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, provider_version: u32, start_time: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer =
            RecordWriter::create(&path, HISTORY_MAGIC, HISTORY_FORMAT_VERSION, provider_version)?;
        let reader = RecordReader::open(&path)?;
        tracing::debug!(path = %path.display(), start_time, "interval store created");

        Ok(Self {
            path,
            provider_version,
            state: RwLock::new(HistoryState {
                start_time,
                current_end: start_time,
                names: Vec::new(),
                by_name: HashMap::new(),
                metadata: Vec::new(),
                columns: Vec::new(),
                declared: 0,
                writer: Some(writer),
                closed: false,
            }),
            reader,
            built: BuildLatch::new(),
        })
    }

    /// Reopen a finished store read-only. Only the index is rebuilt in
    /// memory; values stay in the file.
    pub fn open_existing(path: impl AsRef<Path>, provider_version: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = HistoryState {
            start_time: 0,
            current_end: 0,
            names: Vec::new(),
            by_name: HashMap::new(),
            metadata: Vec::new(),
            columns: Vec::new(),
            declared: 0,
            writer: None,
            closed: true,
        };
        let mut close: Option<CloseRecord> = None;

        codec::scan(&path, HISTORY_MAGIC, HISTORY_FORMAT_VERSION, provider_version, |offset, kind, data| {
            if close.is_some() {
                return Err(Error::Corruption("record found after close record".into()));
            }
            match kind {
                codec::RECORD_ATTRIBUTE => state.declare(codec::decode(data)?),
                codec::RECORD_INTERVAL => {
                    // Only the span is needed here, the value stays on disk.
                    let interval: Interval<IgnoredAny> = codec::decode(data)?;
                    let entry = Closed {
                        start: interval.start,
                        end: interval.end,
                        has_value: interval.value.is_some(),
                        offset,
                    };
                    state.column_or_corrupt(interval.attribute)?.index(interval.attribute, entry)
                }
                codec::RECORD_REVERT => {
                    let rec: RevertRecord = codec::decode(data)?;
                    state.column_or_corrupt(rec.attribute)?.closed.pop().map(|_| ()).ok_or_else(|| {
                        Error::Corruption(format!("revert of empty attribute {}", rec.attribute))
                    })
                }
                codec::RECORD_CLOSE => {
                    close = Some(codec::decode(data)?);
                    Ok(())
                }
                other => Err(Error::Corruption(format!("unknown record kind {other}"))),
            }
        })?;

        let close = close.ok_or_else(|| {
            Error::Corruption(format!("interval store {} was never closed", path.display()))
        })?;
        state.start_time = close.start_time;
        state.current_end = close.end_time;
        state.declared = state.names.len();
        tracing::debug!(
            path = %path.display(),
            attributes = state.names.len(),
            end_time = close.end_time,
            "interval store reopened"
        );

        let reader = RecordReader::open(&path)?;
        Ok(Self {
            path,
            provider_version,
            state: RwLock::new(state),
            reader,
            built: BuildLatch::released(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn provider_version(&self) -> u32 {
        self.provider_version
    }

    pub fn start_time(&self) -> i64 {
        self.state.read().start_time
    }

    pub fn current_end_time(&self) -> i64 {
        self.state.read().current_end
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    // ========================================================================
    // Attribute tree
    // ========================================================================

    /// Quark of `name`, allocating a null column the first time. The
    /// declaration reaches the file with the next write.
    pub fn get_or_create_attribute(&self, name: &str) -> Attribute {
        if let Some(a) = self.attribute(name) {
            return a;
        }
        let mut state = self.state.write();
        if let Some(a) = state.by_name.get(name) {
            return *a;
        }
        let attribute = Attribute(state.names.len() as u32);
        let ongoing = (!state.closed).then(|| Ongoing { start: state.start_time, value: None });
        state.names.push(name.to_string());
        state.by_name.insert(name.to_string(), attribute);
        state.metadata.push(None);
        state.columns.push(Column { closed: Vec::new(), ongoing });
        attribute
    }

    pub fn attribute(&self, name: &str) -> Option<Attribute> {
        self.state.read().by_name.get(name).copied()
    }

    pub fn attribute_name(&self, attribute: Attribute) -> Option<String> {
        self.state.read().names.get(attribute.index()).cloned()
    }

    pub fn attribute_count(&self) -> usize {
        self.state.read().names.len()
    }

    /// Attach a JSON document to an attribute, persisted in the attribute tree.
    pub fn set_attribute_metadata(&self, attribute: Attribute, value: serde_json::Value) -> Result<()> {
        let mut state = self.state.write();
        state.check_writable()?;
        state.declare_pending()?;
        let name = state.names.get(attribute.index()).cloned().ok_or_else(|| {
            Error::StorageError(format!("unknown attribute {attribute}"))
        })?;
        let rec = AttributeRecord { attribute, name, metadata: Some(value) };
        state.append(codec::RECORD_ATTRIBUTE, &rec)?;
        state.metadata[attribute.index()] = rec.metadata;
        Ok(())
    }

    pub fn attribute_metadata(&self, attribute: Attribute) -> Option<serde_json::Value> {
        self.state.read().metadata.get(attribute.index()).cloned().flatten()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Close the ongoing interval at `time - 1` with its current value and
    /// open `value` at `time`.
    pub fn modify_attribute(&self, time: i64, attribute: Attribute, value: Option<V>) -> Result<()> {
        self.state.write().modify(time, attribute, None, value)
    }

    /// Like [`modify_attribute`](Self::modify_attribute), but the interval
    /// being closed takes `closing` as its final value. Both happen under one
    /// lock so readers never see the ongoing interval holding `closing`.
    pub fn close_and_modify(
        &self,
        time: i64,
        attribute: Attribute,
        closing: Option<V>,
        value: Option<V>,
    ) -> Result<()> {
        self.state.write().modify(time, attribute, Some(closing), value)
    }

    /// Replace the value of the ongoing interval in place.
    pub fn update_ongoing(&self, attribute: Attribute, value: Option<V>) -> Result<()> {
        let mut state = self.state.write();
        state.check_writable()?;
        let ongoing = state.ongoing_mut(attribute)?;
        ongoing.value = value;
        Ok(())
    }

    /// Give the closed interval covering `time` a new value, keeping its
    /// span. Returns the interval as it now reads.
    pub fn replace_closed(&self, time: i64, attribute: Attribute, value: Option<V>) -> Result<Interval<V>> {
        let mut state = self.state.write();
        state.check_writable()?;
        let column = state.column(attribute)?;
        let entry = column
            .closed_at(time)
            .map(|idx| column.closed[idx])
            .ok_or_else(|| Error::StorageError(format!(
                "attribute {attribute} has no closed interval at {time}"
            )))?;
        let interval = Interval { attribute, start: entry.start, end: entry.end, value };
        state.persist(&interval)?;
        Ok(interval)
    }

    /// Drop the ongoing interval and reopen the one before it, with the
    /// value `reopen` maps its old value to. With no closed interval left
    /// the column reopens at the start time from a null value.
    ///
    /// Returns the dropped interval, `None` if the column was still null
    /// from the start time.
    pub fn revert_ongoing(
        &self,
        attribute: Attribute,
        reopen: impl FnOnce(&Option<V>) -> Option<V>,
    ) -> Result<Option<Interval<V>>> {
        let mut state = self.state.write();
        state.check_writable()?;
        let start_time = state.start_time;
        let current_end = state.current_end;
        let column = state.column(attribute)?;
        let ongoing = column.ongoing.clone().ok_or_else(|| {
            Error::StorageError(format!("attribute {attribute} has no ongoing interval"))
        })?;
        let previous = match column.closed.last() {
            Some(entry) => Some(self.read_closed(attribute, entry)?),
            None if ongoing.value.is_none() => return Ok(None),
            None => None,
        };

        let reopened = match previous {
            Some(prev) => {
                state.append(codec::RECORD_REVERT, &RevertRecord { attribute })?;
                state.column_mut(attribute)?.closed.pop();
                Ongoing { start: prev.start, value: reopen(&prev.value) }
            }
            None => Ongoing { start: start_time, value: reopen(&None) },
        };
        state.column_mut(attribute)?.ongoing = Some(reopened);
        Ok(Some(Interval {
            attribute,
            start: ongoing.start,
            end: current_end,
            value: ongoing.value,
        }))
    }

    /// Close every ongoing interval at `end_time`, finish the file and mark
    /// the store read-only. `end_time` earlier than the current end time is
    /// raised to it.
    pub fn close_history(&self, end_time: i64) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        let end = end_time.max(state.current_end);
        state.current_end = end;
        let result = state.finish();
        // The store is read-only whether or not the file was finished.
        state.closed = true;
        state.writer = None;
        drop(state);
        self.built.release();
        result
    }

    pub fn wait_until_built(&self, timeout: Duration) -> bool {
        self.built.wait(timeout)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// The interval covering `time` on `attribute`.
    pub fn query_single_state(&self, time: i64, attribute: Attribute) -> Result<Interval<V>> {
        let state = self.state.read();
        state.check_time(time)?;
        let column = state.column(attribute)?;
        if let Some(ongoing) = &column.ongoing {
            if time >= ongoing.start {
                return Ok(state.ongoing_interval(attribute, ongoing));
            }
        }
        if column.closed.is_empty() && column.ongoing.is_none() {
            return Ok(state.null_interval(attribute));
        }
        let idx = column.closed_at(time).ok_or_else(|| {
            Error::Corruption(format!("no interval of attribute {attribute} covers {time}"))
        })?;
        self.read_closed(attribute, &column.closed[idx])
    }

    /// Span of the interval covering `time`, answered from memory.
    pub fn query_span(&self, time: i64, attribute: Attribute) -> Result<Span> {
        let state = self.state.read();
        state.check_time(time)?;
        let column = state.column(attribute)?;
        if let Some(ongoing) = &column.ongoing {
            if time >= ongoing.start {
                return Ok(Span {
                    start: ongoing.start,
                    end: state.current_end,
                    has_value: ongoing.value.is_some(),
                });
            }
        }
        if column.closed.is_empty() && column.ongoing.is_none() {
            return Ok(Span { start: state.start_time, end: state.current_end, has_value: false });
        }
        column
            .closed_at(time)
            .map(|idx| column.closed[idx].span())
            .ok_or_else(|| Error::Corruption(format!(
                "no interval of attribute {attribute} covers {time}"
            )))
    }

    /// The ongoing interval of `attribute`, or its last one once closed.
    pub fn query_ongoing(&self, attribute: Attribute) -> Result<Interval<V>> {
        let state = self.state.read();
        let column = state.column(attribute)?;
        match (&column.ongoing, column.closed.last()) {
            (Some(ongoing), _) => Ok(state.ongoing_interval(attribute, ongoing)),
            (None, Some(last)) => self.read_closed(attribute, last),
            (None, None) => Ok(state.null_interval(attribute)),
        }
    }

    /// Number of intervals of `attribute` holding a value.
    pub fn valued_count(&self, attribute: Attribute) -> Result<usize> {
        let state = self.state.read();
        let column = state.column(attribute)?;
        let ongoing = column.ongoing.as_ref().is_some_and(|o| o.value.is_some());
        Ok(column.closed.iter().filter(|c| c.has_value).count() + usize::from(ongoing))
    }

    /// Every interval of `attribute`, ongoing one included, read back from
    /// the file.
    pub fn intervals(&self, attribute: Attribute) -> Result<Vec<Interval<V>>> {
        let state = self.state.read();
        let column = state.column(attribute)?;
        if column.closed.is_empty() && column.ongoing.is_none() {
            return Ok(vec![state.null_interval(attribute)]);
        }
        let mut out = column
            .closed
            .iter()
            .map(|entry| self.read_closed(attribute, entry))
            .collect::<Result<Vec<_>>>()?;
        if let Some(ongoing) = &column.ongoing {
            out.push(state.ongoing_interval(attribute, ongoing));
        }
        Ok(out)
    }

    fn read_closed(&self, attribute: Attribute, entry: &Closed) -> Result<Interval<V>> {
        let interval: Interval<V> = self.reader.read_at(entry.offset, codec::RECORD_INTERVAL)?;
        if interval.attribute != attribute || interval.start != entry.start || interval.end != entry.end {
            return Err(Error::Corruption(format!(
                "record at offset {} is not interval [{}, {}] of attribute {attribute}",
                entry.offset, entry.start, entry.end
            )));
        }
        Ok(interval)
    }
}

impl<V> HistoryState<V>
where
    V: Clone + Serialize,
{
    fn check_writable(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvariantViolation("interval store is closed for writing".into()));
        }
        Ok(())
    }

    fn check_time(&self, time: i64) -> Result<()> {
        if time < self.start_time || time > self.current_end {
            return Err(Error::TimeRange { time, start: self.start_time, end: self.current_end });
        }
        Ok(())
    }

    fn column(&self, attribute: Attribute) -> Result<&Column<V>> {
        self.columns
            .get(attribute.index())
            .ok_or_else(|| Error::StorageError(format!("unknown attribute {attribute}")))
    }

    fn column_mut(&mut self, attribute: Attribute) -> Result<&mut Column<V>> {
        self.columns
            .get_mut(attribute.index())
            .ok_or_else(|| Error::StorageError(format!("unknown attribute {attribute}")))
    }

    fn column_or_corrupt(&mut self, attribute: Attribute) -> Result<&mut Column<V>> {
        self.columns.get_mut(attribute.index()).ok_or_else(|| {
            Error::Corruption(format!("record for unknown attribute {attribute}"))
        })
    }

    fn ongoing_mut(&mut self, attribute: Attribute) -> Result<&mut Ongoing<V>> {
        self.column_mut(attribute)?.ongoing.as_mut().ok_or_else(|| {
            Error::StorageError(format!("attribute {attribute} has no ongoing interval"))
        })
    }

    fn ongoing_interval(&self, attribute: Attribute, ongoing: &Ongoing<V>) -> Interval<V> {
        Interval {
            attribute,
            start: ongoing.start,
            end: self.current_end,
            value: ongoing.value.clone(),
        }
    }

    /// Whole-range null interval of an attribute allocated after close.
    fn null_interval(&self, attribute: Attribute) -> Interval<V> {
        Interval { attribute, start: self.start_time, end: self.current_end, value: None }
    }

    fn append<T: Serialize>(&mut self, kind: u8, payload: &T) -> Result<u64> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::InvariantViolation("interval store is closed for writing".into()))?
            .append(kind, payload)
    }

    /// Replay one attribute record from the file.
    fn declare(&mut self, rec: AttributeRecord) -> Result<()> {
        let idx = rec.attribute.index();
        if idx == self.names.len() {
            self.by_name.insert(rec.name.clone(), rec.attribute);
            self.names.push(rec.name);
            self.metadata.push(rec.metadata);
            self.columns.push(Column { closed: Vec::new(), ongoing: None });
            return Ok(());
        }
        if self.names.get(idx) != Some(&rec.name) {
            return Err(Error::Corruption(format!("attribute {} out of sequence", rec.attribute)));
        }
        self.metadata[idx] = rec.metadata;
        Ok(())
    }

    /// Write the declarations of attributes allocated since the last write.
    fn declare_pending(&mut self) -> Result<()> {
        while self.declared < self.names.len() {
            let idx = self.declared;
            let rec = AttributeRecord {
                attribute: Attribute(idx as u32),
                name: self.names[idx].clone(),
                metadata: self.metadata[idx].clone(),
            };
            self.append(codec::RECORD_ATTRIBUTE, &rec)?;
            self.declared += 1;
        }
        Ok(())
    }

    /// Append a closed interval and index it.
    fn persist(&mut self, interval: &Interval<V>) -> Result<()> {
        self.declare_pending()?;
        let offset = self.append(codec::RECORD_INTERVAL, interval)?;
        let entry = Closed {
            start: interval.start,
            end: interval.end,
            has_value: interval.value.is_some(),
            offset,
        };
        self.column_mut(interval.attribute)?.index(interval.attribute, entry)
    }

    fn modify(
        &mut self,
        time: i64,
        attribute: Attribute,
        closing: Option<Option<V>>,
        value: Option<V>,
    ) -> Result<()> {
        self.check_writable()?;
        let current_end = self.current_end;
        let ongoing = self.ongoing_mut(attribute)?;
        if time < ongoing.start {
            return Err(Error::TimeRange { time, start: ongoing.start, end: current_end });
        }
        if time == ongoing.start {
            ongoing.value = value;
        } else {
            let closed = Interval {
                attribute,
                start: ongoing.start,
                end: time - 1,
                value: closing.unwrap_or_else(|| ongoing.value.clone()),
            };
            self.persist(&closed)?;
            *self.ongoing_mut(attribute)? = Ongoing { start: time, value };
        }
        self.current_end = self.current_end.max(time);
        Ok(())
    }

    /// Close every ongoing interval at the current end time and write the
    /// close record.
    fn finish(&mut self) -> Result<()> {
        self.declare_pending()?;
        let end = self.current_end;
        for idx in 0..self.columns.len() {
            let attribute = Attribute(idx as u32);
            if let Some(ongoing) = self.columns[idx].ongoing.take() {
                let interval = Interval { attribute, start: ongoing.start, end, value: ongoing.value };
                self.persist(&interval)?;
            }
        }
        let close = CloseRecord { start_time: self.start_time, end_time: end };
        self.append(codec::RECORD_CLOSE, &close)?;
        match self.writer.take() {
            Some(writer) => writer.finish(),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
