//! # log
//!
//! why: the unit of replication, one accepted client operation
//! relations: stored by LogStore implementations, carried by Append messages
//! what: LogEntry with routing fields (client, origin) and an opaque typed payload

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// Peer that accepted the write from a caller
    pub client: PeerId,
    /// Caller-chosen id used to route the commit notification back
    pub origin: u64,
    /// Type tag of the payload
    pub sub_serial: u32,
    /// Opaque payload handed to the application on commit
    pub content: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry with no routing information
    pub fn new(term: u64, index: u64, content: Vec<u8>) -> Self {
        Self {
            term,
            index,
            client: 0,
            origin: 0,
            sub_serial: 0,
            content,
        }
    }

    /// Attach the client peer and caller origin
    pub fn with_origin(mut self, client: PeerId, origin: u64) -> Self {
        self.client = client;
        self.origin = origin;
        self
    }

    pub fn with_sub_serial(mut self, sub_serial: u32) -> Self {
        self.sub_serial = sub_serial;
        self
    }

    /// Bytes this entry occupies once stored, used for size accounting
    pub fn stored_len(&self) -> u64 {
        ENTRY_HEADER_LEN + self.content.len() as u64
    }
}

/// term, index, client, origin (u64 each) + sub_serial, content length (u32 each)
pub const ENTRY_HEADER_LEN: u64 = 8 * 4 + 4 * 2;
