use std::io;

use thiserror::Error;

use crate::node::NodeState;
use crate::PeerId;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, current leader is {0:?}")]
    NotLeader(Option<PeerId>),

    #[error("Failed to persist entry {index}: {reason}")]
    WalFailed { index: u64, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] io::Error),

    #[error("A membership change is already in progress")]
    MembershipChangeInProgress,

    #[error("Invalid membership: {0}")]
    InvalidMembership(String),

    #[error("Operation not allowed while {0}")]
    IllegalState(NodeState),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Peer has shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RaftError>;
