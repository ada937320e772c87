//! # log
//!
//! why: manage the append-only log of tasks that mokka replicates
//! relations: owned by node.rs, fed by replication.rs, persisted via mokka-storage
//! what: LogEntry and its task lifecycle, commit boundary, content hash, replication checks

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ReplicationError, TaskError};

/// Processing state of one task. Only moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Proposed,
    Reserved,
    Executed,
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The task payload
    pub payload: Vec<u8>,
    /// Local processing state, never replicated
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

impl LogEntry {
    /// Create a new, freshly proposed log entry
    pub fn new(term: u64, index: u64, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            payload,
            lifecycle: Lifecycle::Proposed,
        }
    }

    pub fn replicated(&self) -> ReplicatedEntry {
        ReplicatedEntry {
            term: self.term,
            index: self.index,
            payload: self.payload.clone(),
        }
    }
}

/// The part of an entry that travels between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedEntry {
    pub term: u64,
    pub index: u64,
    pub payload: Vec<u8>,
}

/// Position of an entry, handed back to proposers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRef {
    pub index: u64,
    pub term: u64,
}

/// Last committed position plus the hash chained over all committed entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastInfo {
    pub index: u64,
    pub term: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// entry extended the log
    Appended,
    /// same index and term already present
    Duplicate,
    /// an uncommitted conflicting suffix was dropped first
    Replaced,
}

#[derive(Debug, Clone, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
    commit_index: u64,
    committed_hash: [u8; 32],
    unpersisted_from: Option<u64>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted entries. Anything after the first gap is
    /// dropped and the commit index is capped at the last entry.
    pub fn restore(entries: Vec<LogEntry>, commit_index: u64) -> Self {
        let mut log = Self::new();
        for entry in entries {
            if entry.index != log.last_index() + 1 {
                break;
            }
            log.entries.push(entry);
        }
        log.commit_to(commit_index);
        log.unpersisted_from = None;
        log
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(0, |entry| entry.term)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        let position = index.checked_sub(1)?;
        self.entries.get(position as usize)
    }

    fn get_mut(&mut self, index: u64) -> Option<&mut LogEntry> {
        let position = index.checked_sub(1)?;
        self.entries.get_mut(position as usize)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|entry| entry.term)
    }

    /// Up to `max` entries starting at `from`, ready to ship.
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<ReplicatedEntry> {
        let start = from.max(1) as usize - 1;
        self.entries
            .iter()
            .skip(start)
            .take(max)
            .map(LogEntry::replicated)
            .collect()
    }

    /// Append a new task at the end of the log.
    pub fn propose(&mut self, term: u64, payload: Vec<u8>) -> EntryRef {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry::new(term, index, payload));
        self.mark_unpersisted(index);
        EntryRef { index, term }
    }

    /// Apply one entry shipped by the leader.
    pub fn append_replicated(
        &mut self,
        entry: ReplicatedEntry,
    ) -> Result<AppendOutcome, ReplicationError> {
        let last_index = self.last_index();
        if entry.index == 0 || entry.index > last_index + 1 {
            return Err(ReplicationError::Gap {
                index: entry.index,
                last_index,
            });
        }

        if entry.index == last_index + 1 {
            self.push_replicated(entry);
            return Ok(AppendOutcome::Appended);
        }

        let recorded = self.term_at(entry.index).unwrap_or(0);
        if recorded == entry.term {
            return Ok(AppendOutcome::Duplicate);
        }
        if entry.index <= self.commit_index {
            return Err(ReplicationError::ConflictsWithCommitted { index: entry.index });
        }
        if entry.term < recorded {
            return Err(ReplicationError::StaleTerm {
                index: entry.index,
                term: entry.term,
                recorded,
            });
        }

        self.truncate_from(entry.index);
        self.push_replicated(entry);
        Ok(AppendOutcome::Replaced)
    }

    fn push_replicated(&mut self, entry: ReplicatedEntry) {
        let index = entry.index;
        self.entries
            .push(LogEntry::new(entry.term, entry.index, entry.payload));
        self.mark_unpersisted(index);
    }

    /// Drop every entry at or after `index`. Committed entries are never dropped;
    /// returns false when nothing was removed.
    pub fn truncate_from(&mut self, index: u64) -> bool {
        let index = index.max(self.commit_index + 1);
        if index > self.last_index() {
            return false;
        }
        self.entries.truncate(index as usize - 1);
        self.mark_unpersisted(index);
        true
    }

    /// Move the commit boundary forward to `index` (capped at the last entry),
    /// extending the content hash. Returns whether the boundary moved.
    pub fn commit_to(&mut self, index: u64) -> bool {
        let target = index.min(self.last_index());
        if target <= self.commit_index {
            return false;
        }
        for position in self.commit_index..target {
            let entry = &self.entries[position as usize];
            self.committed_hash = chain_hash(&self.committed_hash, entry);
        }
        self.commit_index = target;
        true
    }

    /// Claim a proposed task so exactly one worker executes it.
    pub fn reserve(&mut self, index: u64) -> Result<(), TaskError> {
        let entry = self.get_mut(index).ok_or(TaskError::UnknownIndex(index))?;
        if entry.lifecycle != Lifecycle::Proposed {
            return Err(TaskError::AlreadyReserved(index));
        }
        entry.lifecycle = Lifecycle::Reserved;
        self.mark_unpersisted(index);
        Ok(())
    }

    /// Finish a reserved, committed task and hand its payload to the caller.
    pub fn execute(&mut self, index: u64) -> Result<Vec<u8>, TaskError> {
        let committed = index <= self.commit_index;
        let entry = self.get_mut(index).ok_or(TaskError::UnknownIndex(index))?;
        if entry.lifecycle != Lifecycle::Reserved {
            return Err(TaskError::NotReserved(index));
        }
        if !committed {
            return Err(TaskError::NotCommitted(index));
        }
        entry.lifecycle = Lifecycle::Executed;
        let payload = entry.payload.clone();
        self.mark_unpersisted(index);
        Ok(payload)
    }

    pub fn last_info(&self) -> LastInfo {
        LastInfo {
            index: self.commit_index,
            term: self.term_at(self.commit_index).unwrap_or(0),
            hash: hex::encode(self.committed_hash),
        }
    }

    /// Entries changed since the last call: the first changed index and
    /// everything from there on. Storage truncates at that index and appends.
    pub fn take_unpersisted(&mut self) -> Option<(u64, Vec<LogEntry>)> {
        let from = self.unpersisted_from.take()?;
        let start = (from.max(1) - 1) as usize;
        let tail = self.entries.iter().skip(start).cloned().collect();
        Some((from, tail))
    }

    fn mark_unpersisted(&mut self, index: u64) {
        self.unpersisted_from = Some(self.unpersisted_from.map_or(index, |from| from.min(index)));
    }
}

fn chain_hash(previous: &[u8; 32], entry: &LogEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(previous);
    hasher.update(entry.index.to_le_bytes());
    hasher.update(entry.term.to_le_bytes());
    hasher.update(&entry.payload);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}
