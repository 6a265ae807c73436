//! membership change through joint consensus

use std::collections::BTreeSet;

use tracing::{debug, info};

use super::RaftPeer;
use crate::error::{RaftError, Result};
use crate::graph::RaftGraph;
use crate::message::{Confirm, ModifyGraph, RaftMessage};
use crate::node::NodeState;
use crate::storage::LogStore;
use crate::transport::{Application, Scheduler, Transport};
use crate::PeerId;

impl<S, T, A, C> RaftPeer<S, T, A, C>
where
    S: LogStore,
    T: Transport,
    A: Application,
    C: Scheduler,
{
    /// Switch the voting membership to `members`.
    ///
    /// Leader only. Both memberships must independently reach a majority
    /// (for elections, commits and confirmations) until every member has
    /// acknowledged the change.
    pub fn change_membership(&mut self, members: Vec<PeerId>) -> Result<()> {
        if self.me.state != NodeState::Leader {
            return Err(RaftError::NotLeader(self.me.leader));
        }
        if self.joint.is_some() {
            return Err(RaftError::MembershipChangeInProgress);
        }
        let members: BTreeSet<PeerId> = members.into_iter().collect();
        if members.is_empty() {
            return Err(RaftError::InvalidMembership("membership cannot be empty".to_string()));
        }
        if members.contains(&0) {
            return Err(RaftError::InvalidMembership("peer id 0 is reserved".to_string()));
        }

        let next = self.graph_from(members.iter().copied());
        info!(
            peer = self.me.peer,
            term = self.me.term,
            old = ?self.graph.members(),
            new = ?next.members(),
            "membership change started"
        );
        self.joint = Some(next);
        let start = self.me.index + 1;
        for peer in self.others() {
            self.next_index.entry(peer).or_insert(start);
        }
        self.resume_membership_change()?;
        let me = self.me.peer;
        for peer in members.iter().copied().filter(|p| *p != me) {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// (re)announce the pending membership and collect confirmations afresh
    pub(super) fn resume_membership_change(&mut self) -> Result<()> {
        let peer = self.me.peer;
        let members = match self.joint.as_mut() {
            Some(joint) => {
                joint.clear_confirms();
                joint.confirm(peer);
                joint.members()
            }
            None => return Ok(()),
        };
        self.graph.clear_confirms();
        self.graph.confirm(peer);

        let announce = RaftMessage::ModifyGraph(ModifyGraph {
            term: self.me.term,
            leader: peer,
            members,
            joint: true,
        });
        self.broadcast(&announce);
        self.try_finish_membership()
    }

    pub(super) fn on_modify_graph(&mut self, modify: ModifyGraph) -> Result<()> {
        let leader = modify.leader;
        if !self.admit_leader(modify.term, leader)? {
            return Ok(());
        }
        let next = self.graph_from(modify.members.iter().copied());
        let peer = self.me.peer;

        if modify.joint {
            debug!(peer, term = self.me.term, members = ?modify.members, "joint membership announced");
            let joining = next.contains(peer);
            self.joint = Some(next);
            if joining {
                self.enter_membership();
            }
            self.sync_self();
            let confirm = Confirm {
                peer,
                term: self.me.term,
                commit: self.me.commit,
                index: self.me.index,
                index_term: self.me.index_term,
                leader,
            };
            self.send(leader, RaftMessage::Confirm(confirm));
            return Ok(());
        }

        info!(peer, term = self.me.term, members = ?modify.members, "membership switched");
        self.joint = None;
        self.graph = next;
        if self.graph.contains(peer) {
            self.enter_membership();
            self.sync_self();
        } else {
            self.become_outside();
        }
        Ok(())
    }

    pub(super) fn on_confirm(&mut self, confirm: Confirm) -> Result<()> {
        if self.me.state != NodeState::Leader || confirm.term != self.me.term {
            return Ok(());
        }
        let joint = match self.joint.as_mut() {
            Some(joint) => joint,
            None => return Ok(()),
        };
        joint.confirm(confirm.peer);
        self.graph.confirm(confirm.peer);
        debug!(peer = self.me.peer, from = confirm.peer, "membership change confirmed");
        self.try_finish_membership()
    }

    fn try_finish_membership(&mut self) -> Result<()> {
        let ready = match &self.joint {
            Some(joint) => joint.is_major_confirm() && self.graph.is_major_confirm(),
            None => false,
        };
        if !ready {
            return Ok(());
        }
        let targets = self.others();
        let mut next = match self.joint.take() {
            Some(next) => next,
            None => return Ok(()),
        };
        next.clear_confirms();
        let members = next.members();
        self.graph = next;
        self.next_index.retain(|peer, _| members.contains(peer));
        info!(
            peer = self.me.peer,
            term = self.me.term,
            members = ?members,
            "membership change complete"
        );

        let finish = RaftMessage::ModifyGraph(ModifyGraph {
            term: self.me.term,
            leader: self.me.peer,
            members,
            joint: false,
        });
        for peer in targets {
            self.send(peer, finish.clone());
        }
        if self.graph.contains(self.me.peer) {
            self.sync_self();
            self.advance_commit()
        } else {
            self.become_outside();
            Ok(())
        }
    }

    /// a fresh graph for `members`, keeping what is already known about them
    fn graph_from(&self, members: impl IntoIterator<Item = PeerId>) -> RaftGraph {
        let mut graph = RaftGraph::new(members);
        for peer in graph.members() {
            let known = if peer == self.me.peer {
                Some(&self.me)
            } else {
                self.graph.get(peer)
            };
            if let Some(machine) = known {
                graph.append(machine.clone());
            }
        }
        graph
    }

    /// a non-voter or removed peer becomes a voter again
    fn enter_membership(&mut self) {
        if matches!(self.me.state, NodeState::Client | NodeState::Outside) {
            info!(peer = self.me.peer, term = self.me.term, "joined voting membership");
            self.me.state = NodeState::Follower;
            self.heard_from_leader = true;
            self.start_no_heartbeat();
        }
    }
}
