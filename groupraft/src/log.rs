//! The in-memory log of a Raft server.
//!
//! The log holds the suffix of the replicated log that is still useful in
//! memory: everything after the last snapshot boundary, plus up to
//! `snapshot_trailing` entries retained below it for catching up lagging
//! followers. Entries are indexed by `offset`, the index of the entry just
//! before the first one held in memory.
//!
//! Command payloads are `Bytes` slices of a shared batch allocation, so a
//! contiguous range of entries appended together releases its backing buffer
//! only when the last clone is dropped. On top of that, explicit
//! acquire/release counts pin ranges that have been handed to the IO layer:
//! truncating a pinned range fails with `LogBusy` until it is released.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::error::RaftError;
use crate::membership::Configuration;
use crate::LogIndex;
use crate::Term;

/// The payload of a log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An opaque state-machine command.
    Command(Bytes),
    /// A no-payload entry used to fence causally-dependent callbacks.
    Barrier,
    /// A cluster membership change.
    ConfigChange(Configuration),
}

/// A single log entry. Entries are immutable once appended; the index is
/// implied by the entry's position in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The term in which the entry was created.
    pub term: Term,
    /// This entry's payload.
    pub payload: EntryPayload,
}

/// An in-memory entry along with its IO pin count.
#[derive(Debug)]
struct Slot {
    entry: Entry,
    refs: u32,
}

/// The in-memory log.
#[derive(Debug, Default)]
pub struct Log {
    /// The index of the entry just before the first in-memory one.
    offset: LogIndex,
    /// The live entries, covering `offset+1 ..= offset+slots.len()`.
    slots: VecDeque<Slot>,
    /// The index of the last entry covered by the most recent snapshot.
    snapshot_last_index: LogIndex,
    /// The term of that entry.
    snapshot_last_term: Term,
    /// Entries at or below this index may be dropped once unreferenced.
    compact_floor: LogIndex,
}

impl Log {
    /// Create an empty log.
    pub fn new() -> Self {
        Default::default()
    }

    /// The index of the last entry, or of the snapshot boundary when the log
    /// holds no entries.
    pub fn last_index(&self) -> LogIndex {
        self.offset + self.slots.len() as u64
    }

    /// The term of the last entry, falling back to the snapshot boundary.
    pub fn last_term(&self) -> Term {
        match self.slots.back() {
            Some(slot) => slot.entry.term,
            None => self.snapshot_last_term,
        }
    }

    /// The index of the first entry held in memory, when any.
    pub fn first_index(&self) -> LogIndex {
        self.offset + 1
    }

    /// The number of entries held in memory.
    pub fn num_entries(&self) -> usize {
        self.slots.len()
    }

    /// The index of the last entry covered by the most recent snapshot.
    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_last_index
    }

    /// The term of the last entry covered by the most recent snapshot.
    pub fn snapshot_term(&self) -> Term {
        self.snapshot_last_term
    }

    /// Append a single entry, returning its index.
    pub fn append(&mut self, term: Term, payload: EntryPayload) -> LogIndex {
        self.slots.push_back(Slot {
            entry: Entry { term, payload },
            refs: 0,
        });
        self.last_index()
    }

    /// Append one command entry per buffer, returning the index of the first.
    ///
    /// The buffers of one call are expected to be slices of a single batch
    /// allocation, so the batch is freed when the last entry referencing it
    /// goes away.
    pub fn append_commands(&mut self, term: Term, bufs: &[Bytes]) -> LogIndex {
        let first = self.last_index() + 1;
        for buf in bufs {
            self.append(term, EntryPayload::Command(buf.clone()));
        }
        first
    }

    /// Append a configuration-change entry, returning its index.
    pub fn append_configuration(&mut self, term: Term, configuration: Configuration) -> LogIndex {
        self.append(term, EntryPayload::ConfigChange(configuration))
    }

    /// Borrow the entry at the given index, when it is in memory.
    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        if index <= self.offset {
            return None;
        }
        self.slots.get((index - self.offset - 1) as usize).map(|s| &s.entry)
    }

    /// The term of the entry at the given index.
    ///
    /// Returns 0 when the entry is neither in memory nor the snapshot
    /// boundary itself.
    pub fn term_of(&self, index: LogIndex) -> Term {
        if index == 0 {
            return 0;
        }
        if index == self.snapshot_last_index {
            return self.snapshot_last_term;
        }
        self.get(index).map(|e| e.term).unwrap_or(0)
    }

    /// Acquire all entries from the given index onward, pinning them against
    /// truncation until released.
    pub fn acquire(&mut self, from: LogIndex) -> Result<Vec<Entry>, RaftError> {
        self.acquire_section(from, self.last_index())
    }

    /// Acquire the entries in `from ..= to` (clamped to the last index),
    /// pinning them against truncation until released.
    ///
    /// An empty range yields an empty vector and pins nothing. Asking for
    /// entries that are no longer in memory fails with `NotFound`.
    pub fn acquire_section(&mut self, from: LogIndex, to: LogIndex) -> Result<Vec<Entry>, RaftError> {
        let to = std::cmp::min(to, self.last_index());
        if from > to {
            return Ok(Vec::new());
        }
        if from <= self.offset {
            return Err(RaftError::NotFound);
        }
        let start = (from - self.offset - 1) as usize;
        let end = (to - self.offset) as usize;
        let mut entries = Vec::with_capacity(end - start);
        for slot in self.slots.range_mut(start..end) {
            slot.refs += 1;
            entries.push(slot.entry.clone());
        }
        Ok(entries)
    }

    /// Clone the entries in `from ..= to` (clamped to the last index) without
    /// pinning them.
    ///
    /// Used for building outbound messages: the cloned `Bytes` payloads keep
    /// their batch allocations alive on their own, so the log range itself
    /// need not stay pinned for the lifetime of the send.
    pub fn section(&self, from: LogIndex, to: LogIndex) -> Result<Vec<Entry>, RaftError> {
        let to = std::cmp::min(to, self.last_index());
        if from > to {
            return Ok(Vec::new());
        }
        if from <= self.offset {
            return Err(RaftError::NotFound);
        }
        let start = (from - self.offset - 1) as usize;
        let end = (to - self.offset) as usize;
        Ok(self.slots.range(start..end).map(|s| s.entry.clone()).collect())
    }

    /// Release a previously acquired range of `n` entries starting at `from`.
    pub fn release(&mut self, from: LogIndex, n: usize) {
        for index in from..from + n as u64 {
            if index <= self.offset {
                continue;
            }
            if let Some(slot) = self.slots.get_mut((index - self.offset - 1) as usize) {
                slot.refs = slot.refs.saturating_sub(1);
            }
        }
        self.compact();
    }

    /// Delete all entries from the given index onward.
    ///
    /// Truncation below or at the snapshot boundary is a protocol violation;
    /// truncation over a range pinned by in-flight IO fails with `LogBusy`.
    pub fn truncate(&mut self, from: LogIndex) -> Result<(), RaftError> {
        assert!(
            from > self.snapshot_last_index,
            "cannot truncate at or below the snapshot boundary"
        );
        if from > self.last_index() {
            return Ok(());
        }
        if from <= self.offset {
            return Err(RaftError::NotFound);
        }
        let start = (from - self.offset - 1) as usize;
        if self.slots.range(start..).any(|slot| slot.refs > 0) {
            return Err(RaftError::LogBusy);
        }
        self.slots.truncate(start);
        Ok(())
    }

    /// Drop the in-memory suffix from the given index onward without any IO
    /// implication. Used to unwind a failed local append.
    pub fn discard(&mut self, from: LogIndex) -> Result<(), RaftError> {
        self.truncate(from)
    }

    /// Check whether any entry from the given index onward is pinned.
    pub fn is_referenced(&self, from: LogIndex) -> bool {
        if from > self.last_index() || from <= self.offset {
            return false;
        }
        let start = (from - self.offset - 1) as usize;
        self.slots.range(start..).any(|slot| slot.refs > 0)
    }

    /// Advance the snapshot boundary to `last_index`, dropping unreferenced
    /// entries at or below `last_index - trailing`.
    pub fn snapshot(&mut self, last_index: LogIndex, trailing: u64) {
        assert!(last_index >= self.snapshot_last_index);
        let term = self.term_of(last_index);
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = term;
        self.compact_floor = std::cmp::max(self.compact_floor, last_index.saturating_sub(trailing));
        self.compact();
    }

    /// Adopt a foreign snapshot boundary, dropping all in-memory entries.
    ///
    /// Fails with `LogBusy` when any entry is still pinned by in-flight IO.
    pub fn restore(&mut self, last_index: LogIndex, last_term: Term) -> Result<(), RaftError> {
        if self.slots.iter().any(|slot| slot.refs > 0) {
            return Err(RaftError::LogBusy);
        }
        self.slots.clear();
        self.offset = last_index;
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;
        self.compact_floor = last_index;
        Ok(())
    }

    /// Drop unreferenced prefix entries at or below the compaction floor.
    fn compact(&mut self) {
        while let Some(front) = self.slots.front() {
            if self.offset + 1 > self.compact_floor || front.refs > 0 {
                break;
            }
            self.slots.pop_front();
            self.offset += 1;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
