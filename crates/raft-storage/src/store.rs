//! # store
//!
//! why: durable raft log whose prefix can be reclaimed file by file
//! relations: implements raft_core::LogStore; built on segment::Segment and meta::MetaFile
//! what: StoreConfig, SegmentedLogStore (open, recovery, append, lookup, truncation, snapshots)
//!
//! directory layout:
//! - `meta/log_meta.json`: LogMeta
//! - `segments/segment_<start>.{open,closed}`: entries, at most one open
//! - `snapshot/snapshot_meta.json`: SnapshotMeta

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use raft_core::{LogEntry, LogMeta, LogStore, PeerId, SnapshotMeta};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::meta::MetaFile;
use crate::segment::{parse_file_name, Segment};

/// where and how the log is kept on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub dir: PathBuf,
    /// a segment is closed once the next record would push it past this
    pub max_segment_size: u64,
    /// fsync every appended record and the metadata written with it
    pub sync_on_append: bool,
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_segment_size: 64 * 1024 * 1024,
            sync_on_append: true,
        }
    }
}

fn invalid_input(message: String) -> StorageError {
    StorageError::Io(io::Error::new(io::ErrorKind::InvalidInput, message))
}

/// file-backed LogStore made of contiguous segment files
pub struct SegmentedLogStore {
    config: StoreConfig,
    segment_dir: PathBuf,
    /// keyed by start index for floor lookups
    segments: BTreeMap<u64, Segment>,
    meta: LogMeta,
    snapshot: SnapshotMeta,
    meta_file: MetaFile<LogMeta>,
    snapshot_file: MetaFile<SnapshotMeta>,
}

impl SegmentedLogStore {
    /// open (or create) the store under `config.dir` and recover its state
    pub fn open(config: StoreConfig) -> Result<Self> {
        let meta_dir = config.dir.join("meta");
        let segment_dir = config.dir.join("segments");
        let snapshot_dir = config.dir.join("snapshot");
        for dir in [&meta_dir, &segment_dir, &snapshot_dir] {
            fs::create_dir_all(dir).map_err(|source| StorageError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }

        let meta_file = MetaFile::new(&meta_dir, "log_meta");
        let snapshot_file = MetaFile::new(&snapshot_dir, "snapshot_meta");
        let meta = meta_file.load()?.unwrap_or_default();
        let snapshot = snapshot_file.load()?.unwrap_or_default();

        let mut store = Self {
            config,
            segment_dir,
            segments: BTreeMap::new(),
            meta,
            snapshot,
            meta_file,
            snapshot_file,
        };
        store.recover()?;
        info!(
            dir = %store.config.dir.display(),
            segments = store.segments.len(),
            start = store.meta.start,
            end = store.meta.index,
            commit = store.meta.commit,
            term = store.meta.term,
            "log store opened"
        );
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_dir(&self) -> &Path {
        &self.segment_dir
    }

    // -- recovery --

    fn recover(&mut self) -> Result<()> {
        let mut found = Vec::new();
        for dirent in fs::read_dir(&self.segment_dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            match name.to_str().and_then(parse_file_name) {
                Some((start, writable)) => found.push((start, writable, dirent.path())),
                None => warn!(file = ?name, "ignoring unknown file in segment directory"),
            }
        }
        found.sort_by_key(|(start, _, _)| *start);
        let newest = found.last().map(|(start, _, _)| *start);

        for (start, writable, path) in found {
            let mut segment = Segment::load(path, start, writable)?;
            if segment.is_empty() {
                segment.remove()?;
                continue;
            }
            if segment.is_writable() && Some(start) != newest {
                warn!(start, "closing stray writable segment");
                segment.close()?;
            }
            self.segments.insert(start, segment);
        }

        let mut contiguous = true;
        let mut expected: Option<u64> = None;
        for segment in self.segments.values() {
            if expected.map_or(false, |next| next != segment.start()) {
                contiguous = false;
                break;
            }
            expected = Some(segment.end() + 1);
        }

        // records past meta.index belong to an append that never returned
        if contiguous && self.computed_end() > self.meta.index && self.first_start() <= self.meta.index + 1 {
            warn!(
                recorded = self.meta.index,
                found = self.computed_end(),
                "dropping unacknowledged tail"
            );
            self.cut_after(self.meta.index)?;
        }

        if !contiguous || self.computed_end() != self.meta.index {
            return self.reset(contiguous);
        }

        if let Some(first) = self.segments.values().next() {
            self.meta.start = first.start();
        }
        self.meta.index_term = self.term_of(self.meta.index)?;
        self.meta.accept = self.meta.accept.min(self.meta.index);
        self.meta.commit = self.meta.commit.min(self.meta.accept);
        self.flush_meta(true)
    }

    /// drop every segment and restart the log right after the snapshot
    fn reset(&mut self, contiguous: bool) -> Result<()> {
        warn!(
            contiguous,
            recorded = self.meta.index,
            found = self.computed_end(),
            "log metadata disagrees with segments, resetting log"
        );
        for (_, segment) in std::mem::take(&mut self.segments) {
            segment.remove()?;
        }
        let base = self.snapshot.commit;
        self.meta = LogMeta {
            start: base + 1,
            term: self.meta.term,
            vote: self.meta.vote,
            commit: base,
            accept: base,
            index: base,
            index_term: self.snapshot.term,
        };
        self.flush_meta(true)
    }

    fn first_start(&self) -> u64 {
        self.segments.keys().next().copied().unwrap_or(self.meta.start)
    }

    fn computed_end(&self) -> u64 {
        match self.segments.values().next_back() {
            Some(last) => last.end(),
            None => self.meta.start.saturating_sub(1),
        }
    }

    // -- internals --

    fn flush_meta(&self, sync: bool) -> Result<()> {
        self.meta_file.save(&self.meta, sync)
    }

    /// persist `next` and only then make it the live metadata
    fn commit_meta(&mut self, next: LogMeta, sync: bool) -> Result<()> {
        self.meta_file.save(&next, sync)?;
        self.meta = next;
        Ok(())
    }

    fn read_entry(&self, index: u64) -> Result<Option<LogEntry>> {
        if index < self.meta.start || index > self.meta.index {
            return Ok(None);
        }
        match self.segments.range(..=index).next_back() {
            Some((_, segment)) => segment.read(index),
            None => Ok(None),
        }
    }

    fn term_of(&self, index: u64) -> Result<u64> {
        if index == 0 {
            return Ok(0);
        }
        if let Some(entry) = self.read_entry(index)? {
            return Ok(entry.term);
        }
        if index == self.snapshot.commit {
            return Ok(self.snapshot.term);
        }
        Ok(0)
    }

    /// remove segments and records above `new_end`
    fn cut_after(&mut self, new_end: u64) -> Result<()> {
        let doomed: Vec<u64> = self.segments.range(new_end + 1..).map(|(start, _)| *start).collect();
        for start in doomed {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        if let Some((_, segment)) = self.segments.range_mut(..=new_end).next_back() {
            segment.truncate_after(new_end)?;
        }
        Ok(())
    }

    /// the segment the entry at `index` goes to, rotating when needed
    fn segment_for(&mut self, index: u64, len: u64) -> Result<&mut Segment> {
        let max = self.config.max_segment_size;
        let reuse = self
            .segments
            .values()
            .next_back()
            .filter(|last| last.is_writable() && (last.is_empty() || last.size() + len <= max))
            .map(|last| last.start());
        let key = match reuse {
            Some(start) => start,
            None => {
                if let Some(last) = self.segments.values_mut().next_back() {
                    last.close()?;
                }
                let segment = Segment::create(&self.segment_dir, index)?;
                self.segments.insert(index, segment);
                index
            }
        };
        self.segments.get_mut(&key).ok_or_else(|| StorageError::Corrupt {
            path: self.segment_dir.clone(),
            reason: format!("segment {} vanished", key),
        })
    }

    fn append_entry(&mut self, entry: &LogEntry) -> Result<bool> {
        if entry.index != self.meta.index + 1 {
            return Ok(false);
        }
        let sync = self.config.sync_on_append;
        let previous = self.meta.index;
        self.segment_for(entry.index, entry.stored_len())?.append(entry, sync)?;
        let next = LogMeta {
            index: entry.index,
            index_term: entry.term,
            accept: entry.index,
            ..self.meta
        };
        if let Err(e) = self.commit_meta(next, sync) {
            // the record must not outlive a failed append
            if let Err(undo) = self.cut_after(previous) {
                warn!(index = entry.index, error = %undo, "could not undo failed append");
            }
            return Err(e);
        }
        Ok(true)
    }

    fn drop_prefix(&mut self, new_first: u64) -> Result<u64> {
        let new_first = new_first.min(self.meta.commit + 1);
        loop {
            let start = match self.segments.iter().next() {
                Some((start, segment)) if !segment.is_writable() && segment.end() < new_first => *start,
                _ => break,
            };
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        let start = self
            .segments
            .keys()
            .next()
            .copied()
            .unwrap_or(self.meta.index + 1);
        if start > self.meta.start {
            debug!(from = self.meta.start, to = start, "log prefix dropped");
            self.commit_meta(LogMeta { start, ..self.meta }, true)?;
        }
        Ok(self.meta.start)
    }

    fn drop_suffix(&mut self, new_end: u64) -> Result<Option<LogEntry>> {
        if new_end < self.meta.commit {
            return Err(invalid_input(format!(
                "cannot truncate to {} below commit {}",
                new_end, self.meta.commit
            )));
        }
        if new_end >= self.meta.index {
            return self.read_entry(self.meta.index);
        }
        self.cut_after(new_end)?;
        let next = LogMeta {
            index: new_end,
            index_term: self.term_of(new_end)?,
            accept: self.meta.accept.min(new_end),
            ..self.meta
        };
        self.commit_meta(next, true)?;
        debug!(end = new_end, "log suffix dropped");
        self.read_entry(new_end)
    }

    fn record_snapshot(&mut self, index: u64, term: u64) -> Result<()> {
        if index > self.meta.commit {
            return Err(invalid_input(format!(
                "snapshot {} beyond commit {}",
                index, self.meta.commit
            )));
        }
        let prior = self.snapshot.commit;
        self.snapshot = SnapshotMeta { commit: index, term };
        self.snapshot_file.save(&self.snapshot, true)?;
        self.drop_prefix(prior + 1)?;
        Ok(())
    }

    fn replace_with_snapshot(&mut self, index: u64, term: u64) -> Result<()> {
        for (_, segment) in std::mem::take(&mut self.segments) {
            segment.remove()?;
        }
        self.snapshot = SnapshotMeta { commit: index, term };
        self.snapshot_file.save(&self.snapshot, true)?;
        let next = LogMeta {
            start: index + 1,
            index,
            index_term: term,
            commit: index,
            accept: index,
            ..self.meta
        };
        self.commit_meta(next, true)?;
        info!(index, term, "log replaced by snapshot");
        Ok(())
    }
}

impl LogStore for SegmentedLogStore {
    fn append(&mut self, entry: LogEntry) -> io::Result<bool> {
        Ok(self.append_entry(&entry)?)
    }

    fn get_entry(&self, index: u64) -> io::Result<Option<LogEntry>> {
        Ok(self.read_entry(index)?)
    }

    fn truncate_prefix(&mut self, new_first: u64) -> io::Result<u64> {
        Ok(self.drop_prefix(new_first)?)
    }

    fn truncate_suffix(&mut self, new_end: u64) -> io::Result<Option<LogEntry>> {
        Ok(self.drop_suffix(new_end)?)
    }

    fn log_meta(&self) -> &LogMeta {
        &self.meta
    }

    fn snapshot_meta(&self) -> &SnapshotMeta {
        &self.snapshot
    }

    fn save_term(&mut self, term: u64, vote: Option<PeerId>) -> io::Result<()> {
        Ok(self.commit_meta(LogMeta { term, vote, ..self.meta }, true)?)
    }

    fn save_commit(&mut self, commit: u64) -> io::Result<()> {
        if commit > self.meta.accept {
            return Err(invalid_input(format!(
                "commit {} beyond accepted {}",
                commit, self.meta.accept
            ))
            .into());
        }
        if commit > self.meta.commit {
            self.commit_meta(LogMeta { commit, ..self.meta }, true)?;
        }
        Ok(())
    }

    fn take_snapshot(&mut self, index: u64, term: u64) -> io::Result<()> {
        Ok(self.record_snapshot(index, term)?)
    }

    fn install_snapshot(&mut self, index: u64, term: u64) -> io::Result<()> {
        Ok(self.replace_with_snapshot(index, term)?)
    }

    fn total_bytes(&self) -> u64 {
        self.segments.values().map(|s| s.size()).sum()
    }
}
