//! # message
//!
//! why: define every message a peer exchanges with the rest of the cluster
//! relations: produced and consumed by engine/, encoded/framed by the external transport
//! what: one struct per message kind, RaftMessage as the closed set, RejectCode

use serde::{Deserialize, Serialize};

use crate::{LogEntry, PeerId};

/// Why a peer refused a vote request, an append or a snapshot chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    /// the sender's term is behind the receiver's
    LowerTerm,
    /// the candidate's log is behind the voter's
    Obsolete,
    /// the voter already voted for someone else this term
    AlreadyVote,
    /// the receiver's log does not contain the append's predecessor
    Conflict,
    /// a leader saw another leader claim the same term
    SplitCluster,
    /// the receiver cannot handle this message in its current state
    IllegalState,
    /// the receiver failed to persist the entries
    WalFailed,
}

/// Candidate asking for a vote, with its log position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: PeerId,
    pub index: u64,
    pub index_term: u64,
    pub accept: u64,
    pub commit: u64,
}

/// A granted vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub term: u64,
    pub peer: PeerId,
    pub index: u64,
    pub index_term: u64,
    pub accept: u64,
    pub commit: u64,
    pub candidate: PeerId,
}

/// Log replication, also used as the heartbeat when `entries` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Append {
    pub term: u64,
    pub leader: PeerId,
    pub commit: u64,
    pub pre_index: u64,
    pub pre_index_term: u64,
    pub entries: Vec<LogEntry>,
}

/// Successful append: the follower's log matches the leader's up to `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub term: u64,
    pub peer: PeerId,
    pub index: u64,
    pub index_term: u64,
    pub leader: PeerId,
    pub commit: u64,
}

/// Refusal of a vote, append or snapshot chunk.
///
/// Always carries the rejecting peer's own position so the recipient can
/// correct itself without another round trip. For `Conflict`, `reject_to`
/// is the highest index the leader should try to match next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub term: u64,
    pub peer: PeerId,
    pub code: RejectCode,
    pub reject_to: u64,
    pub candidate: Option<PeerId>,
    pub leader: Option<PeerId>,
    pub index: u64,
    pub index_term: u64,
    pub accept: u64,
    pub commit: u64,
}

/// Membership change announcement.
///
/// `joint = true` opens joint consensus between the current membership and
/// `members`; `joint = false` makes `members` the sole membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyGraph {
    pub term: u64,
    pub leader: PeerId,
    pub members: Vec<PeerId>,
    pub joint: bool,
}

/// Acknowledgement of a joint membership announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirm {
    pub peer: PeerId,
    pub term: u64,
    pub commit: u64,
    pub index: u64,
    pub index_term: u64,
    pub leader: PeerId,
}

/// A client operation submitted on a non-leader, relayed to the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    pub peer: PeerId,
    pub origin: u64,
    pub sub_serial: u32,
    pub content: Vec<u8>,
}

/// Sent by the leader to an entry's client peer once the entry committed,
/// or by any peer that could not take a forwarded operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    pub term: u64,
    /// the answering peer
    pub leader: PeerId,
    /// 0 when refused
    pub index: u64,
    pub origin: u64,
    /// false: the operation was dropped and never reached a log
    pub committed: bool,
}

/// One chunk of the leader's application snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub term: u64,
    pub leader: PeerId,
    /// last log index folded into the snapshot
    pub index: u64,
    pub index_term: u64,
    /// byte offset of `data` within the snapshot
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

/// All possible Raft messages between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    VoteRequest(VoteRequest),
    Ballot(Ballot),
    Append(Append),
    Accept(Accept),
    Reject(Reject),
    ModifyGraph(ModifyGraph),
    Confirm(Confirm),
    Forward(Forward),
    Notify(Notify),
    InstallSnapshot(InstallSnapshot),
}

impl RaftMessage {
    /// The peer that produced this message.
    pub fn sender(&self) -> PeerId {
        match self {
            RaftMessage::VoteRequest(m) => m.candidate,
            RaftMessage::Ballot(m) => m.peer,
            RaftMessage::Append(m) => m.leader,
            RaftMessage::Accept(m) => m.peer,
            RaftMessage::Reject(m) => m.peer,
            RaftMessage::ModifyGraph(m) => m.leader,
            RaftMessage::Confirm(m) => m.peer,
            RaftMessage::Forward(m) => m.peer,
            RaftMessage::Notify(m) => m.leader,
            RaftMessage::InstallSnapshot(m) => m.leader,
        }
    }

    /// The sender's term, for every message that carries one.
    pub fn term(&self) -> Option<u64> {
        match self {
            RaftMessage::VoteRequest(m) => Some(m.term),
            RaftMessage::Ballot(m) => Some(m.term),
            RaftMessage::Append(m) => Some(m.term),
            RaftMessage::Accept(m) => Some(m.term),
            RaftMessage::Reject(m) => Some(m.term),
            RaftMessage::ModifyGraph(m) => Some(m.term),
            RaftMessage::Confirm(m) => Some(m.term),
            RaftMessage::Forward(_) => None,
            RaftMessage::Notify(m) => Some(m.term),
            RaftMessage::InstallSnapshot(m) => Some(m.term),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest(_) => "vote_request",
            RaftMessage::Ballot(_) => "ballot",
            RaftMessage::Append(_) => "append",
            RaftMessage::Accept(_) => "accept",
            RaftMessage::Reject(_) => "reject",
            RaftMessage::ModifyGraph(_) => "modify_graph",
            RaftMessage::Confirm(_) => "confirm",
            RaftMessage::Forward(_) => "forward",
            RaftMessage::Notify(_) => "notify",
            RaftMessage::InstallSnapshot(_) => "install_snapshot",
        }
    }
}
