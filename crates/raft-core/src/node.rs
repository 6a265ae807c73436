//! # node
//!
//! why: define the per-peer raft machine and its possible states
//! relations: the self machine is owned by engine/, peer machines live in graph.rs
//! what: NodeState enum, RaftMachine struct, conversions from observed messages

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::{Accept, Ballot, Confirm, Reject, VoteRequest};
use crate::PeerId;

/// Every state a peer can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Not part of any configured topology, ignores the protocol
    Outside,
    /// Member of the mesh without a vote; forwards submissions
    Client,
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Voted this term, waiting out the election timeout
    Elector,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
    /// Leader or follower in the middle of a membership change
    Joint,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

impl NodeState {
    /// States that take part in elections and quorum counting.
    pub fn is_voter(self) -> bool {
        !matches!(self, NodeState::Outside | NodeState::Client)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Outside => "outside",
            NodeState::Client => "client",
            NodeState::Follower => "follower",
            NodeState::Elector => "elector",
            NodeState::Candidate => "candidate",
            NodeState::Leader => "leader",
            NodeState::Joint => "joint",
        };
        f.write_str(name)
    }
}

/// What one peer is known to be.
///
/// For the local peer this is authoritative state; for remote peers it is
/// the latest view carried by a protocol message, used only for quorum
/// arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMachine {
    pub peer: PeerId,
    pub state: NodeState,
    pub term: u64,
    /// who this peer voted for in `term`
    pub candidate: Option<PeerId>,
    /// the leader this peer believes in
    pub leader: Option<PeerId>,
    /// last local entry
    pub index: u64,
    pub index_term: u64,
    pub commit: u64,
    /// highest index durably appended (and, for remote peers, acknowledged)
    pub accept: u64,
    /// leader's view of how far this peer's log matches its own
    pub match_index: u64,
}

impl RaftMachine {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            state: NodeState::Follower,
            term: 0,
            candidate: None,
            leader: None,
            index: 0,
            index_term: 0,
            commit: 0,
            accept: 0,
            match_index: 0,
        }
    }

    /// Build the vote request this machine would broadcast as a candidate.
    pub fn vote_request(&self) -> VoteRequest {
        VoteRequest {
            term: self.term,
            candidate: self.peer,
            index: self.index,
            index_term: self.index_term,
            accept: self.accept,
            commit: self.commit,
        }
    }

    /// True when `other`'s log position is at least ours on every axis.
    pub fn is_covered_by(&self, index: u64, index_term: u64, accept: u64, commit: u64) -> bool {
        index >= self.index && index_term >= self.index_term && accept >= self.accept && commit >= self.commit
    }
}

impl From<&VoteRequest> for RaftMachine {
    fn from(m: &VoteRequest) -> Self {
        Self {
            state: NodeState::Candidate,
            term: m.term,
            candidate: Some(m.candidate),
            index: m.index,
            index_term: m.index_term,
            accept: m.accept,
            commit: m.commit,
            ..RaftMachine::new(m.candidate)
        }
    }
}

impl From<&Ballot> for RaftMachine {
    fn from(m: &Ballot) -> Self {
        Self {
            state: NodeState::Elector,
            term: m.term,
            candidate: Some(m.candidate),
            index: m.index,
            index_term: m.index_term,
            accept: m.accept,
            commit: m.commit,
            ..RaftMachine::new(m.peer)
        }
    }
}

impl From<&Reject> for RaftMachine {
    fn from(m: &Reject) -> Self {
        Self {
            term: m.term,
            candidate: m.candidate,
            leader: m.leader,
            index: m.index,
            index_term: m.index_term,
            accept: m.accept,
            commit: m.commit,
            ..RaftMachine::new(m.peer)
        }
    }
}

impl From<&Accept> for RaftMachine {
    fn from(m: &Accept) -> Self {
        Self {
            term: m.term,
            leader: Some(m.leader),
            index: m.index,
            index_term: m.index_term,
            commit: m.commit,
            accept: m.index,
            match_index: m.index,
            ..RaftMachine::new(m.peer)
        }
    }
}

impl From<&Confirm> for RaftMachine {
    fn from(m: &Confirm) -> Self {
        Self {
            term: m.term,
            leader: Some(m.leader),
            index: m.index,
            index_term: m.index_term,
            commit: m.commit,
            ..RaftMachine::new(m.peer)
        }
    }
}
