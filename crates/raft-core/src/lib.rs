//! # raft-core
//!
//! why: implement raft consensus with joint membership changes in portable rust
//! relations: timers from raft-timer, durable logs from raft-storage (or MemLogStore)
//! what: messages, peer machines, quorum graphs, the peer engine and a threaded runtime

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod log;
pub mod message;
pub mod node;
pub mod runtime;
pub mod storage;
pub mod transport;

/// Cluster-wide peer identifier; 0 means "no peer".
pub type PeerId = u64;

pub use config::RaftConfig;
pub use engine::{Event, RaftPeer, Submitted};
pub use error::{RaftError, Result};
pub use graph::RaftGraph;
pub use log::LogEntry;
pub use message::{RaftMessage, RejectCode};
pub use node::{NodeState, RaftMachine};
pub use raft_timer::{TaskHandle, TimingWheel, WheelConfig};
pub use runtime::{spawn_peer, Mailbox, PeerHandle, PeerStatus, WheelScheduler};
pub use storage::{LogMeta, LogStore, MemLogStore, SnapshotMeta};
pub use transport::{Application, Scheduler, TimerEvent, Transport};
