//! # storage
//!
//! why: the engine needs a durable, index-addressed log without knowing how it is laid out
//! relations: implemented by raft-storage (segmented files) and MemLogStore (tests, embedding)
//! what: LogStore trait, LogMeta / SnapshotMeta records, MemLogStore

use std::collections::VecDeque;
use std::io;

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::PeerId;

/// persisted view of the log and of the peer's durable election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMeta {
    /// first index still held in the log
    pub start: u64,
    /// latest term this peer has seen
    pub term: u64,
    /// who this peer voted for in `term`
    pub vote: Option<PeerId>,
    pub commit: u64,
    pub accept: u64,
    /// last index held in the log (start - 1 when empty)
    pub index: u64,
    pub index_term: u64,
}

impl Default for LogMeta {
    fn default() -> Self {
        Self {
            start: 1,
            term: 0,
            vote: None,
            commit: 0,
            accept: 0,
            index: 0,
            index_term: 0,
        }
    }
}

/// last snapshot point: every entry up to `commit` is folded into application state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub commit: u64,
    pub term: u64,
}

/// durable, index-addressed storage for the replicated log
///
/// indices are contiguous: entries exist for exactly `start_index()..=end_index()`.
/// every mutation is durable before it returns.
pub trait LogStore {
    /// append one entry; returns false (and changes nothing) unless
    /// `entry.index == end_index() + 1`
    fn append(&mut self, entry: LogEntry) -> io::Result<bool>;

    /// fetch the entry at `index`, none outside the retained range
    fn get_entry(&self, index: u64) -> io::Result<Option<LogEntry>>;

    /// term of the entry at `index`; index 0 and the snapshot point are
    /// answered even though no entry is held for them
    fn term_at(&self, index: u64) -> io::Result<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        let snapshot = self.snapshot_meta();
        if index == snapshot.commit && index < self.start_index() {
            return Ok(Some(snapshot.term));
        }
        Ok(self.get_entry(index)?.map(|entry| entry.term))
    }

    /// up to `max` consecutive entries starting at `from`
    fn entries(&self, from: u64, max: usize) -> io::Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        let mut index = from.max(self.start_index());
        while index <= self.end_index() && out.len() < max {
            match self.get_entry(index)? {
                Some(entry) => out.push(entry),
                None => break,
            }
            index += 1;
        }
        Ok(out)
    }

    fn start_index(&self) -> u64 {
        self.log_meta().start
    }

    fn end_index(&self) -> u64 {
        self.log_meta().index
    }

    /// discard entries below `new_first`, never past commit + 1;
    /// returns the first index actually retained
    fn truncate_prefix(&mut self, new_first: u64) -> io::Result<u64>;

    /// discard entries above `new_end`; refuses to cut committed entries.
    /// returns the new tail entry, if one is still held
    fn truncate_suffix(&mut self, new_end: u64) -> io::Result<Option<LogEntry>>;

    fn log_meta(&self) -> &LogMeta;

    fn snapshot_meta(&self) -> &SnapshotMeta;

    /// persist the current term and vote together
    fn save_term(&mut self, term: u64, vote: Option<PeerId>) -> io::Result<()>;

    /// persist a new commit index (monotonic, never above accept)
    fn save_commit(&mut self, commit: u64) -> io::Result<()>;

    /// record a snapshot at (`index`, `term`) and drop the log up to the
    /// previous snapshot point
    fn take_snapshot(&mut self, index: u64, term: u64) -> io::Result<()>;

    /// replace the whole log with a snapshot received from the leader;
    /// afterwards the log is empty and starts at `index + 1`
    fn install_snapshot(&mut self, index: u64, term: u64) -> io::Result<()>;

    /// bytes currently held by the log
    fn total_bytes(&self) -> u64;
}

pub(crate) fn invalid_input(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.into())
}

// -- in-memory store --

/// volatile LogStore for tests and embedders that persist elsewhere
#[derive(Debug, Default)]
pub struct MemLogStore {
    entries: VecDeque<LogEntry>,
    meta: LogMeta,
    snapshot: SnapshotMeta,
    bytes: u64,
    fail_appends: bool,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// make every following append fail with an io error until cleared
    pub fn inject_append_failure(&mut self, fail: bool) {
        self.fail_appends = fail;
    }

    fn slot(&self, index: u64) -> Option<usize> {
        if index < self.meta.start || index > self.meta.index {
            return None;
        }
        Some((index - self.meta.start) as usize)
    }

    fn refresh_tail(&mut self) {
        match self.entries.back() {
            Some(last) => {
                self.meta.index = last.index;
                self.meta.index_term = last.term;
            }
            None => {
                self.meta.index = self.meta.start - 1;
                self.meta.index_term = if self.meta.index == self.snapshot.commit {
                    self.snapshot.term
                } else {
                    0
                };
            }
        }
    }
}

impl LogStore for MemLogStore {
    fn append(&mut self, entry: LogEntry) -> io::Result<bool> {
        if self.fail_appends {
            return Err(io::Error::new(io::ErrorKind::Other, "injected append failure"));
        }
        if entry.index != self.meta.index + 1 {
            return Ok(false);
        }
        self.bytes += entry.stored_len();
        self.meta.index = entry.index;
        self.meta.index_term = entry.term;
        self.meta.accept = entry.index;
        self.entries.push_back(entry);
        Ok(true)
    }

    fn get_entry(&self, index: u64) -> io::Result<Option<LogEntry>> {
        Ok(self.slot(index).and_then(|slot| self.entries.get(slot).cloned()))
    }

    fn truncate_prefix(&mut self, new_first: u64) -> io::Result<u64> {
        let new_first = new_first.min(self.meta.commit + 1);
        while self.meta.start < new_first {
            if let Some(entry) = self.entries.pop_front() {
                self.bytes -= entry.stored_len();
            }
            self.meta.start += 1;
        }
        Ok(self.meta.start)
    }

    fn truncate_suffix(&mut self, new_end: u64) -> io::Result<Option<LogEntry>> {
        if new_end < self.meta.commit {
            return Err(invalid_input(format!(
                "cannot truncate to {} below commit {}",
                new_end, self.meta.commit
            )));
        }
        while self.meta.index > new_end {
            if let Some(entry) = self.entries.pop_back() {
                self.bytes -= entry.stored_len();
            }
            self.refresh_tail();
        }
        self.meta.accept = self.meta.accept.min(self.meta.index);
        Ok(self.entries.back().cloned())
    }

    fn log_meta(&self) -> &LogMeta {
        &self.meta
    }

    fn snapshot_meta(&self) -> &SnapshotMeta {
        &self.snapshot
    }

    fn save_term(&mut self, term: u64, vote: Option<PeerId>) -> io::Result<()> {
        self.meta.term = term;
        self.meta.vote = vote;
        Ok(())
    }

    fn save_commit(&mut self, commit: u64) -> io::Result<()> {
        if commit > self.meta.accept {
            return Err(invalid_input(format!(
                "commit {} beyond accepted {}",
                commit, self.meta.accept
            )));
        }
        self.meta.commit = self.meta.commit.max(commit);
        Ok(())
    }

    fn take_snapshot(&mut self, index: u64, term: u64) -> io::Result<()> {
        if index > self.meta.commit {
            return Err(invalid_input(format!("snapshot {} beyond commit", index)));
        }
        let prior = self.snapshot.commit;
        self.snapshot = SnapshotMeta { commit: index, term };
        self.truncate_prefix(prior + 1)?;
        Ok(())
    }

    fn install_snapshot(&mut self, index: u64, term: u64) -> io::Result<()> {
        self.entries.clear();
        self.bytes = 0;
        self.snapshot = SnapshotMeta { commit: index, term };
        self.meta.start = index + 1;
        self.meta.index = index;
        self.meta.index_term = term;
        self.meta.commit = index;
        self.meta.accept = index;
        Ok(())
    }

    fn total_bytes(&self) -> u64 {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: u64) -> MemLogStore {
        let mut store = MemLogStore::new();
        for i in 1..=n {
            assert!(store.append(LogEntry::new(1 + i / 4, i, vec![i as u8])).unwrap());
        }
        store
    }

    #[test]
    fn append_requires_next_index() {
        let mut store = filled(3);
        assert!(!store.append(LogEntry::new(1, 5, vec![])).unwrap());
        assert!(!store.append(LogEntry::new(1, 3, vec![])).unwrap());
        assert_eq!(store.end_index(), 3);
        assert!(store.append(LogEntry::new(1, 4, vec![])).unwrap());
    }

    #[test]
    fn suffix_truncation_keeps_committed_entries() {
        let mut store = filled(6);
        store.save_commit(2).unwrap();

        let tail = store.truncate_suffix(4).unwrap().unwrap();
        assert_eq!(tail.index, 4);
        assert_eq!(store.log_meta().index_term, tail.term);
        assert_eq!(store.log_meta().accept, 4);
        assert!(store.get_entry(5).unwrap().is_none());

        assert!(store.truncate_suffix(1).is_err());
    }

    #[test]
    fn prefix_truncation_is_clamped_to_commit() {
        let mut store = filled(6);
        store.save_commit(3).unwrap();
        assert_eq!(store.truncate_prefix(10).unwrap(), 4);
        assert_eq!(store.start_index(), 4);
        assert!(store.get_entry(3).unwrap().is_none());
        assert_eq!(store.entries(1, 10).unwrap().len(), 3);
    }

    #[test]
    fn snapshot_drops_up_to_previous_snapshot() {
        let mut store = filled(8);
        store.save_commit(6).unwrap();

        store.take_snapshot(3, 1).unwrap();
        assert_eq!(store.start_index(), 1);

        store.take_snapshot(6, 2).unwrap();
        assert_eq!(store.start_index(), 4);
        assert_eq!(store.term_at(6).unwrap(), Some(2));
        assert_eq!(store.term_at(2).unwrap(), None);
    }

    #[test]
    fn install_snapshot_resets_log() {
        let mut store = filled(3);
        store.install_snapshot(10, 4).unwrap();
        assert_eq!(store.start_index(), 11);
        assert_eq!(store.end_index(), 10);
        assert_eq!(store.term_at(10).unwrap(), Some(4));
        assert_eq!(store.total_bytes(), 0);
        assert!(store.append(LogEntry::new(4, 11, vec![])).unwrap());
    }

    #[test]
    fn injected_failure_leaves_log_untouched() {
        let mut store = filled(2);
        store.inject_append_failure(true);
        assert!(store.append(LogEntry::new(1, 3, vec![])).is_err());
        assert_eq!(store.end_index(), 2);
        store.inject_append_failure(false);
        assert!(store.append(LogEntry::new(1, 3, vec![])).unwrap());
    }

    #[test]
    fn commit_cannot_pass_accept() {
        let mut store = filled(2);
        assert!(store.save_commit(3).is_err());
        store.save_commit(2).unwrap();
        store.save_commit(1).unwrap();
        assert_eq!(store.log_meta().commit, 2);
    }
}
