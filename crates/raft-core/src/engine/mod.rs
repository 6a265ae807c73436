//! # engine
//!
//! why: the consensus state machine of one peer, independent of threads and io
//! relations: driven by runtime.rs (or a test harness) through Event; persists via LogStore,
//!            talks through Transport, applies through Application, arms timers through Scheduler
//! what: RaftPeer, Event, Submitted; election / replication / membership / snapshot live in submodules

mod election;
mod membership;
mod replication;
mod snapshot;

use std::collections::BTreeMap;

use raft_timer::TaskHandle;
use tracing::{debug, info, trace, warn};

use crate::config::RaftConfig;
use crate::error::Result;
use crate::graph::RaftGraph;
use crate::message::{RaftMessage, Reject, RejectCode};
use crate::node::{NodeState, RaftMachine};
use crate::storage::LogStore;
use crate::transport::{Application, Scheduler, TimerEvent, Transport};
use crate::PeerId;

/// Input to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(RaftMessage),
    Timer(TimerEvent),
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// appended to the local log as leader; not yet committed
    Appended { index: u64, term: u64 },
    /// relayed to the known leader
    Forwarded { leader: PeerId },
}

#[derive(Debug)]
struct SnapshotTransfer {
    /// leader streaming the snapshot, and its term
    leader: PeerId,
    leader_term: u64,
    index: u64,
    term: u64,
    data: Vec<u8>,
}

/// One raft peer.
///
/// Single-threaded: every input goes through `handle`, `submit` or
/// `change_membership`, and all effects leave through the injected
/// store, transport, application and scheduler.
pub struct RaftPeer<S, T, A, C> {
    config: RaftConfig,
    me: RaftMachine,
    graph: RaftGraph,
    /// membership being switched to while joint consensus is in force
    joint: Option<RaftGraph>,
    store: S,
    transport: T,
    app: A,
    scheduler: C,
    /// last index handed to the application
    applied: u64,
    /// leader only: next index to send to each peer
    next_index: BTreeMap<PeerId, u64>,
    heard_from_leader: bool,
    election_timer: Option<TaskHandle>,
    heartbeat_timer: Option<TaskHandle>,
    no_heartbeat_timer: Option<TaskHandle>,
    incoming_snapshot: Option<SnapshotTransfer>,
}

impl<S, T, A, C> RaftPeer<S, T, A, C>
where
    S: LogStore,
    T: Transport,
    A: Application,
    C: Scheduler,
{
    /// Restore a peer from whatever `store` holds. No timer is armed until `start`.
    pub fn new(config: RaftConfig, store: S, transport: T, app: A, scheduler: C) -> Result<Self> {
        config.validate()?;
        let meta = *store.log_meta();
        let graph = RaftGraph::new(config.members.iter().copied());

        let mut me = RaftMachine::new(config.peer);
        me.state = if graph.contains(config.peer) {
            NodeState::Follower
        } else {
            NodeState::Client
        };
        me.term = meta.term;
        me.candidate = meta.vote;
        me.index = meta.index;
        me.index_term = meta.index_term;
        me.commit = meta.commit;
        me.accept = meta.accept;
        me.match_index = meta.accept;

        let applied = store.snapshot_meta().commit.max(meta.start - 1);
        let mut peer = Self {
            config,
            me,
            graph,
            joint: None,
            store,
            transport,
            app,
            scheduler,
            applied,
            next_index: BTreeMap::new(),
            heard_from_leader: false,
            election_timer: None,
            heartbeat_timer: None,
            no_heartbeat_timer: None,
            incoming_snapshot: None,
        };
        peer.sync_self();
        Ok(peer)
    }

    /// Replay committed entries past the snapshot point and arm the follower timer.
    pub fn start(&mut self) -> Result<()> {
        self.apply_committed()?;
        if self.me.state.is_voter() {
            self.start_no_heartbeat();
        }
        info!(
            peer = self.me.peer,
            term = self.me.term,
            state = %self.me.state,
            index = self.me.index,
            commit = self.me.commit,
            "peer started"
        );
        Ok(())
    }

    /// Disarm every timer; the peer keeps its state and can be dropped.
    pub fn stop(&mut self) {
        self.cancel_election();
        self.cancel_heartbeat();
        self.cancel_no_heartbeat();
        info!(peer = self.me.peer, term = self.me.term, "peer stopped");
    }

    pub fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Message(message) => self.on_message(message),
            Event::Timer(timer) => self.on_timer(timer),
        }
    }

    // -- accessors --

    pub fn id(&self) -> PeerId {
        self.me.peer
    }

    /// the underlying role, never `Joint`
    pub fn state(&self) -> NodeState {
        self.me.state
    }

    /// the role as reported outward: voters report `Joint` while a membership change is pending
    pub fn effective_state(&self) -> NodeState {
        match self.me.state {
            NodeState::Leader | NodeState::Follower | NodeState::Elector | NodeState::Candidate
                if self.joint.is_some() =>
            {
                NodeState::Joint
            }
            state => state,
        }
    }

    pub fn term(&self) -> u64 {
        self.me.term
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.me.leader
    }

    pub fn commit(&self) -> u64 {
        self.me.commit
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn machine(&self) -> &RaftMachine {
        &self.me
    }

    pub fn graph(&self) -> &RaftGraph {
        &self.graph
    }

    pub fn joint_graph(&self) -> Option<&RaftGraph> {
        self.joint.as_ref()
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Tear the peer apart, e.g. to restart it over the same store.
    pub fn into_parts(mut self) -> (S, T, A, C) {
        self.stop();
        (self.store, self.transport, self.app, self.scheduler)
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn scheduler_mut(&mut self) -> &mut C {
        &mut self.scheduler
    }

    // -- dispatch --

    fn on_message(&mut self, message: RaftMessage) -> Result<()> {
        trace!(
            peer = self.me.peer,
            from = message.sender(),
            kind = message.kind(),
            "message received"
        );
        if self.me.state == NodeState::Outside {
            return self.on_message_outside(message);
        }
        match message {
            RaftMessage::VoteRequest(m) => self.on_vote_request(m),
            RaftMessage::Ballot(m) => self.on_ballot(m),
            RaftMessage::Append(m) => self.on_append(m),
            RaftMessage::Accept(m) => self.on_accept(m),
            RaftMessage::Reject(m) => self.on_reject(m),
            RaftMessage::ModifyGraph(m) => self.on_modify_graph(m),
            RaftMessage::Confirm(m) => self.on_confirm(m),
            RaftMessage::Forward(m) => self.on_forward(m),
            RaftMessage::Notify(m) => self.on_notify(m),
            RaftMessage::InstallSnapshot(m) => self.on_install_snapshot(m),
        }
    }

    /// a removed peer only listens for being added back
    fn on_message_outside(&mut self, message: RaftMessage) -> Result<()> {
        let from = message.sender();
        match message {
            RaftMessage::ModifyGraph(m) => self.on_modify_graph(m),
            RaftMessage::Forward(m) => {
                self.refuse_forward(m.peer, m.origin);
                Ok(())
            }
            RaftMessage::VoteRequest(_) | RaftMessage::Append(_) | RaftMessage::InstallSnapshot(_) => {
                self.reply_reject(from, RejectCode::IllegalState, 0);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_timer(&mut self, timer: TimerEvent) -> Result<()> {
        match timer {
            TimerEvent::Election { term } => {
                if self.me.state == NodeState::Candidate && term == self.me.term {
                    info!(peer = self.me.peer, term, "election timed out");
                    self.start_candidacy()?;
                }
            }
            TimerEvent::Heartbeat { term } => {
                if self.me.state == NodeState::Leader && term == self.me.term {
                    self.broadcast_append()?;
                }
            }
            TimerEvent::NoHeartbeat => {
                let waiting = matches!(self.me.state, NodeState::Follower | NodeState::Elector);
                if waiting && self.is_voting_member() {
                    if self.heard_from_leader {
                        self.heard_from_leader = false;
                    } else {
                        info!(peer = self.me.peer, term = self.me.term, "leader silent");
                        self.start_candidacy()?;
                    }
                }
            }
        }
        Ok(())
    }

    // -- shared helpers --

    /// push the local machine into every graph that holds it
    fn sync_self(&mut self) {
        self.me.match_index = self.me.accept;
        let me = self.me.clone();
        if let Some(joint) = self.joint.as_mut() {
            joint.update(me.clone());
        }
        self.graph.update(me);
    }

    /// store a remote peer's view in every graph that holds it
    fn record(&mut self, machine: RaftMachine) {
        if let Some(joint) = self.joint.as_mut() {
            joint.update(machine.clone());
        }
        self.graph.update(machine);
    }

    fn is_voting_member(&self) -> bool {
        let peer = self.me.peer;
        self.graph.contains(peer) || self.joint.as_ref().map_or(false, |j| j.contains(peer))
    }

    /// every peer a broadcast must reach
    fn others(&self) -> Vec<PeerId> {
        match &self.joint {
            Some(joint) => RaftGraph::join(self.me.peer, &self.graph, joint).into_keys().collect(),
            None => self
                .graph
                .members()
                .into_iter()
                .filter(|peer| *peer != self.me.peer)
                .collect(),
        }
    }

    fn send(&mut self, peer: PeerId, message: RaftMessage) {
        let kind = message.kind();
        if !self.transport.send_to_peer(peer, message) {
            debug!(peer = self.me.peer, to = peer, kind, "no session, message dropped");
        }
    }

    fn broadcast(&mut self, message: &RaftMessage) {
        for peer in self.others() {
            self.send(peer, message.clone());
        }
    }

    fn reply_reject(&mut self, to: PeerId, code: RejectCode, reject_to: u64) {
        let reject = Reject {
            term: self.me.term,
            peer: self.me.peer,
            code,
            reject_to,
            candidate: self.me.candidate,
            leader: self.me.leader,
            index: self.me.index,
            index_term: self.me.index_term,
            accept: self.me.accept,
            commit: self.me.commit,
        };
        self.send(to, RaftMessage::Reject(reject));
    }

    fn persist_term(&mut self) -> Result<()> {
        self.store.save_term(self.me.term, self.me.candidate)?;
        Ok(())
    }

    /// reload log position after the store changed it
    fn refresh_from_store(&mut self) {
        let meta = *self.store.log_meta();
        self.me.index = meta.index;
        self.me.index_term = meta.index_term;
        self.me.accept = meta.accept;
        self.me.commit = meta.commit;
        self.sync_self();
    }

    /// fall back to follower, adopting `term` if it is newer
    fn step_down(&mut self, term: u64) -> Result<()> {
        let previous = self.me.state;
        if term > self.me.term {
            self.me.term = term;
            self.me.candidate = None;
            self.persist_term()?;
        }
        self.me.leader = None;
        self.cancel_election();
        self.cancel_heartbeat();
        self.next_index.clear();
        if self.me.state.is_voter() {
            self.me.state = NodeState::Follower;
            self.heard_from_leader = false;
            self.start_no_heartbeat();
        }
        self.sync_self();
        if previous != self.me.state {
            info!(
                peer = self.me.peer,
                term = self.me.term,
                from = %previous,
                "stepped down to follower"
            );
        }
        Ok(())
    }

    /// settle under `leader` for the current term
    fn follow(&mut self, leader: PeerId) {
        match self.me.state {
            NodeState::Candidate => {
                self.me.state = NodeState::Follower;
                self.cancel_election();
                self.start_no_heartbeat();
            }
            NodeState::Elector => self.me.state = NodeState::Follower,
            _ => {}
        }
        if self.me.leader != Some(leader) {
            info!(peer = self.me.peer, term = self.me.term, leader, "following leader");
            self.me.leader = Some(leader);
        }
        self.heard_from_leader = true;
        self.sync_self();
    }

    /// common gate for messages only a leader sends; false when the
    /// message was refused and already answered
    fn admit_leader(&mut self, term: u64, leader: PeerId) -> Result<bool> {
        if term < self.me.term {
            self.reply_reject(leader, RejectCode::LowerTerm, 0);
            return Ok(false);
        }
        if term == self.me.term && self.me.state == NodeState::Leader && leader != self.me.peer {
            warn!(
                peer = self.me.peer,
                term,
                other = leader,
                "another leader claims this term"
            );
            self.reply_reject(leader, RejectCode::SplitCluster, 0);
            return Ok(false);
        }
        if term > self.me.term {
            self.step_down(term)?;
        }
        // a transfer from an earlier leader will never be finished
        let stale = matches!(
            &self.incoming_snapshot,
            Some(t) if t.leader != leader || t.leader_term != term
        );
        if stale {
            debug!(peer = self.me.peer, term, leader, "abandoning snapshot transfer");
            self.incoming_snapshot = None;
        }
        self.follow(leader);
        Ok(true)
    }

    fn become_outside(&mut self) {
        info!(peer = self.me.peer, term = self.me.term, "removed from membership");
        self.me.state = NodeState::Outside;
        self.me.leader = None;
        self.joint = None;
        self.next_index.clear();
        self.cancel_election();
        self.cancel_heartbeat();
        self.cancel_no_heartbeat();
    }

    // -- timers --

    fn cancel_election(&mut self) {
        if let Some(handle) = self.election_timer.take() {
            handle.cancel();
        }
    }

    fn cancel_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat_timer.take() {
            handle.cancel();
        }
    }

    fn cancel_no_heartbeat(&mut self) {
        if let Some(handle) = self.no_heartbeat_timer.take() {
            handle.cancel();
        }
    }

    fn start_no_heartbeat(&mut self) {
        self.cancel_no_heartbeat();
        let period = self.config.election_timeout();
        self.no_heartbeat_timer = Some(self.scheduler.schedule_repeat(period, TimerEvent::NoHeartbeat));
    }

    fn start_election_timer(&mut self) {
        self.cancel_election();
        let delay = self.config.election_timeout();
        let event = TimerEvent::Election { term: self.me.term };
        self.election_timer = Some(self.scheduler.schedule(delay, event));
    }

    fn start_heartbeat(&mut self) {
        self.cancel_heartbeat();
        let period = self.config.heartbeat();
        let event = TimerEvent::Heartbeat { term: self.me.term };
        self.heartbeat_timer = Some(self.scheduler.schedule_repeat(period, event));
    }
}
