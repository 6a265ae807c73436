//! # raft-storage
//!
//! why: provide durable persistence for the raft log using standard rust fs apis
//! relations: implements raft_core::LogStore; handed to raft_core::spawn_peer or RaftPeer::new
//! what: SegmentedLogStore (segment files + json metadata), StoreConfig, StorageError

mod error;
mod meta;
mod segment;
mod store;

pub use error::{Result, StorageError};
pub use store::{SegmentedLogStore, StoreConfig};
