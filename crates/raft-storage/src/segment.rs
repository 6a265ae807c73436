//! # segment
//!
//! why: the log is split into files so compaction can drop whole files
//! relations: owned by store::SegmentedLogStore, which keeps them in a map keyed by start index
//! what: Segment (one file, one contiguous index range), record codec, file naming
//!
//! record layout, all big-endian:
//! term u64 | index u64 | client u64 | origin u64 | sub_serial u32 | content_len u32 | content

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use raft_core::log::ENTRY_HEADER_LEN;
use raft_core::LogEntry;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

const OPEN_EXT: &str = "open";
const CLOSED_EXT: &str = "closed";

/// `segment_<start>.open` for the writable segment, `.closed` otherwise
pub(crate) fn file_name(start: u64, writable: bool) -> String {
    let ext = if writable { OPEN_EXT } else { CLOSED_EXT };
    format!("segment_{:020}.{}", start, ext)
}

/// start index and writable flag of a segment file name
pub(crate) fn parse_file_name(name: &str) -> Option<(u64, bool)> {
    let rest = name.strip_prefix("segment_")?;
    let (start, ext) = rest.split_once('.')?;
    let writable = match ext {
        OPEN_EXT => true,
        CLOSED_EXT => false,
        _ => return None,
    };
    match start.parse() {
        Ok(start) if start > 0 => Some((start, writable)),
        _ => None,
    }
}

// -- record codec --

pub(crate) fn encode(entry: &LogEntry) -> io::Result<Vec<u8>> {
    let content_len = u32::try_from(entry.content.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry content too large"))?;
    let mut buf = Vec::with_capacity(entry.stored_len() as usize);
    buf.write_u64::<BigEndian>(entry.term)?;
    buf.write_u64::<BigEndian>(entry.index)?;
    buf.write_u64::<BigEndian>(entry.client)?;
    buf.write_u64::<BigEndian>(entry.origin)?;
    buf.write_u32::<BigEndian>(entry.sub_serial)?;
    buf.write_u32::<BigEndian>(content_len)?;
    buf.extend_from_slice(&entry.content);
    Ok(buf)
}

/// a record header; `content_len` bytes of content follow it
struct Header {
    term: u64,
    index: u64,
    client: u64,
    origin: u64,
    sub_serial: u32,
    content_len: u32,
}

impl Header {
    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            term: reader.read_u64::<BigEndian>()?,
            index: reader.read_u64::<BigEndian>()?,
            client: reader.read_u64::<BigEndian>()?,
            origin: reader.read_u64::<BigEndian>()?,
            sub_serial: reader.read_u32::<BigEndian>()?,
            content_len: reader.read_u32::<BigEndian>()?,
        })
    }

    fn stored_len(&self) -> u64 {
        ENTRY_HEADER_LEN + u64::from(self.content_len)
    }

    fn read_entry<R: Read>(self, reader: &mut R) -> io::Result<LogEntry> {
        let mut content = vec![0; self.content_len as usize];
        reader.read_exact(&mut content)?;
        Ok(LogEntry {
            term: self.term,
            index: self.index,
            client: self.client,
            origin: self.origin,
            sub_serial: self.sub_serial,
            content,
        })
    }
}

pub(crate) fn decode<R: Read>(reader: &mut R) -> io::Result<LogEntry> {
    Header::read(reader)?.read_entry(reader)
}

// -- segment --

/// One file holding the entries `start..=end`.
pub(crate) struct Segment {
    path: PathBuf,
    file: File,
    start: u64,
    /// start - 1 while empty
    end: u64,
    writable: bool,
    /// byte offset of each record, in index order
    offsets: Vec<u64>,
    size: u64,
}

impl Segment {
    /// create an empty writable segment whose first entry will be `start`
    pub(crate) fn create(dir: &Path, start: u64) -> Result<Self> {
        let path = dir.join(file_name(start, true));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| StorageError::CreateFile {
                path: path.clone(),
                source,
            })?;
        debug!(start, path = %path.display(), "segment created");
        Ok(Self {
            path,
            file,
            start,
            end: start - 1,
            writable: true,
            offsets: Vec::new(),
            size: 0,
        })
    }

    /// Open an existing segment file and index its records.
    ///
    /// A torn or out-of-sequence tail is cut off; everything before it is kept.
    pub(crate) fn load(path: PathBuf, start: u64, writable: bool) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        let mut offsets = Vec::new();
        let mut offset = 0u64;
        let mut reader = io::BufReader::new(&mut file);
        while offset + ENTRY_HEADER_LEN <= len {
            let header = match Header::read(&mut reader) {
                Ok(header) => header,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            // a torn or garbled header may claim more than the file holds
            if offset + header.stored_len() > len {
                break;
            }
            if header.index != start + offsets.len() as u64 {
                warn!(
                    path = %path.display(),
                    expected = start + offsets.len() as u64,
                    found = header.index,
                    "out of sequence record, cutting segment"
                );
                break;
            }
            let stored = header.stored_len();
            header.read_entry(&mut reader)?;
            offsets.push(offset);
            offset += stored;
        }
        drop(reader);
        if offset < len {
            warn!(path = %path.display(), kept = offset, dropped = len - offset, "torn segment tail cut off");
            file.set_len(offset)?;
            file.sync_all()?;
        }
        Ok(Self {
            path,
            file,
            start,
            end: start + offsets.len() as u64 - 1,
            writable,
            offsets,
            size: offset,
        })
    }

    pub(crate) fn start(&self) -> u64 {
        self.start
    }

    pub(crate) fn end(&self) -> u64 {
        self.end
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// append the next entry; the caller checks index continuity
    pub(crate) fn append(&mut self, entry: &LogEntry, sync: bool) -> Result<()> {
        if !self.writable {
            return Err(StorageError::Corrupt {
                path: self.path.clone(),
                reason: format!("append of {} to a closed segment", entry.index),
            });
        }
        let record = encode(entry)?;
        self.file.seek(SeekFrom::Start(self.size))?;
        self.file.write_all(&record)?;
        if sync {
            self.file.sync_data()?;
        }
        self.offsets.push(self.size);
        self.size += record.len() as u64;
        self.end = entry.index;
        Ok(())
    }

    pub(crate) fn read(&self, index: u64) -> Result<Option<LogEntry>> {
        if index < self.start || index > self.end {
            return Ok(None);
        }
        let offset = self.offsets[(index - self.start) as usize];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        let entry = decode(&mut io::BufReader::new(file))?;
        if entry.index != index {
            return Err(StorageError::Corrupt {
                path: self.path.clone(),
                reason: format!("expected entry {}, found {}", index, entry.index),
            });
        }
        Ok(Some(entry))
    }

    /// keep entries up to `new_end`, which must not be below `start`
    pub(crate) fn truncate_after(&mut self, new_end: u64) -> Result<()> {
        if new_end >= self.end {
            return Ok(());
        }
        let keep = (new_end + 1 - self.start) as usize;
        let new_size = self.offsets[keep];
        self.file.set_len(new_size)?;
        self.file.sync_all()?;
        self.offsets.truncate(keep);
        self.size = new_size;
        self.end = new_end;
        debug!(start = self.start, end = new_end, "segment truncated");
        Ok(())
    }

    /// seal the segment and rename it to its closed name
    pub(crate) fn close(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.file.sync_all()?;
        let closed = self.path.with_file_name(file_name(self.start, false));
        fs::rename(&self.path, &closed)?;
        self.path = closed;
        self.writable = false;
        debug!(start = self.start, end = self.end, "segment closed");
        Ok(())
    }

    pub(crate) fn remove(self) -> Result<()> {
        let Segment { path, file, .. } = self;
        drop(file);
        fs::remove_file(&path)?;
        debug!(path = %path.display(), "segment removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(index: u64, content: &[u8]) -> LogEntry {
        LogEntry::new(1, index, content.to_vec()).with_origin(2, 40 + index)
    }

    #[test]
    fn file_names_round_trip() {
        assert_eq!(file_name(7, true), "segment_00000000000000000007.open");
        assert_eq!(parse_file_name(&file_name(7, true)), Some((7, true)));
        assert_eq!(parse_file_name(&file_name(12, false)), Some((12, false)));
        assert_eq!(parse_file_name("segment_12.tmp"), None);
        assert_eq!(parse_file_name(&file_name(0, true)), None);
        assert_eq!(parse_file_name("log_meta.json"), None);
    }

    #[test]
    fn record_header_is_big_endian() {
        let bytes = encode(&LogEntry::new(1, 2, b"xy".to_vec()).with_sub_serial(3)).unwrap();
        assert_eq!(bytes.len() as u64, ENTRY_HEADER_LEN + 2);
        assert_eq!(&bytes[0..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[8..16], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(&bytes[32..36], &[0, 0, 0, 3]);
        assert_eq!(&bytes[36..40], &[0, 0, 0, 2]);
        assert_eq!(&bytes[40..], b"xy");
    }

    #[test]
    fn append_read_and_reload() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 5).unwrap();
        assert!(segment.is_empty());
        segment.append(&entry(5, b"a"), true).unwrap();
        segment.append(&entry(6, b"bb"), true).unwrap();
        assert_eq!(segment.end(), 6);
        assert_eq!(segment.read(6).unwrap(), Some(entry(6, b"bb")));
        assert_eq!(segment.read(7).unwrap(), None);

        let path = segment.path().to_path_buf();
        drop(segment);
        let reloaded = Segment::load(path, 5, true).unwrap();
        assert_eq!(reloaded.end(), 6);
        assert_eq!(reloaded.read(5).unwrap(), Some(entry(5, b"a")));
    }

    #[test]
    fn torn_tail_is_cut_on_load() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1).unwrap();
        segment.append(&entry(1, b"whole"), true).unwrap();
        segment.append(&entry(2, b"torn"), true).unwrap();
        let path = segment.path().to_path_buf();
        let full = segment.size();
        drop(segment);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();
        drop(file);

        let reloaded = Segment::load(path.clone(), 1, true).unwrap();
        assert_eq!(reloaded.end(), 1);
        assert_eq!(reloaded.size(), ENTRY_HEADER_LEN + 5);
        assert_eq!(fs::metadata(&path).unwrap().len(), ENTRY_HEADER_LEN + 5);
    }

    #[test]
    fn oversized_length_claim_is_cut_without_reading_it() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1).unwrap();
        segment.append(&entry(1, b"kept"), true).unwrap();
        let path = segment.path().to_path_buf();
        let kept = segment.size();
        drop(segment);

        let mut garbage = encode(&entry(2, b"")).unwrap();
        garbage[36..40].copy_from_slice(&u32::MAX.to_be_bytes());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&garbage).unwrap();
        drop(file);

        let reloaded = Segment::load(path.clone(), 1, true).unwrap();
        assert_eq!(reloaded.end(), 1);
        assert_eq!(reloaded.size(), kept);
        assert_eq!(fs::metadata(&path).unwrap().len(), kept);
    }

    #[test]
    fn truncate_and_close() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1).unwrap();
        for i in 1..=4 {
            segment.append(&entry(i, b"x"), false).unwrap();
        }
        segment.truncate_after(2).unwrap();
        assert_eq!(segment.end(), 2);
        assert_eq!(segment.read(3).unwrap(), None);

        segment.close().unwrap();
        assert!(!segment.is_writable());
        assert!(segment.path().to_string_lossy().ends_with(".closed"));
        assert!(segment.append(&entry(3, b"x"), false).is_err());
    }
}
