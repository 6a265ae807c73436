//! # graph
//!
//! why: quorum arithmetic over one cluster membership
//! relations: engine/ keeps one graph for the current membership and a second one during joint consensus
//! what: RaftGraph (peer -> last known RaftMachine), majority predicates, membership join

use std::collections::{BTreeMap, BTreeSet};

use crate::node::RaftMachine;
use crate::PeerId;

/// Last known state of every voting member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftGraph {
    machines: BTreeMap<PeerId, RaftMachine>,
    confirmed: BTreeSet<PeerId>,
}

impl RaftGraph {
    /// A graph whose members are all unknown fresh followers
    pub fn new(members: impl IntoIterator<Item = PeerId>) -> Self {
        let machines = members.into_iter().map(|peer| (peer, RaftMachine::new(peer))).collect();
        Self {
            machines,
            confirmed: BTreeSet::new(),
        }
    }

    /// Register or overwrite a peer's last known state.
    pub fn append(&mut self, machine: RaftMachine) {
        self.machines.insert(machine.peer, machine);
    }

    /// Overwrite a member's state; peers outside this graph are ignored.
    pub fn update(&mut self, machine: RaftMachine) -> bool {
        match self.machines.get_mut(&machine.peer) {
            Some(slot) => {
                *slot = machine;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.machines.contains_key(&peer)
    }

    pub fn get(&self, peer: PeerId) -> Option<&RaftMachine> {
        self.machines.get(&peer)
    }

    pub fn get_mut(&mut self, peer: PeerId) -> Option<&mut RaftMachine> {
        self.machines.get_mut(&peer)
    }

    pub fn members(&self) -> Vec<PeerId> {
        self.machines.keys().copied().collect()
    }

    pub fn machines(&self) -> impl Iterator<Item = &RaftMachine> {
        self.machines.values()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Forget every replication ack except `keep`'s own.
    pub fn reset_progress(&mut self, keep: PeerId) {
        for machine in self.machines.values_mut().filter(|m| m.peer != keep) {
            machine.accept = 0;
            machine.match_index = 0;
        }
    }

    fn is_majority(&self, count: usize) -> bool {
        !self.machines.is_empty() && count > self.machines.len() / 2
    }

    /// Majority of members voted for `peer` in `term`.
    pub fn is_major_accept(&self, peer: PeerId, term: u64) -> bool {
        let votes = self
            .machines
            .values()
            .filter(|m| m.term == term && m.candidate == Some(peer))
            .count();
        self.is_majority(votes)
    }

    /// Majority of members report `term` and an accepted index of at least `index`.
    pub fn is_major_accept_at(&self, term: u64, index: u64) -> bool {
        let acks = self
            .machines
            .values()
            .filter(|m| m.term == term && m.accept >= index)
            .count();
        self.is_majority(acks)
    }

    /// Highest index `n` for which `is_major_accept_at(term, n)` holds.
    pub fn quorum_accept(&self, term: u64) -> u64 {
        if self.machines.is_empty() {
            return 0;
        }
        let mut acks: Vec<u64> = self
            .machines
            .values()
            .map(|m| if m.term == term { m.accept } else { 0 })
            .collect();
        acks.sort_unstable_by(|a, b| b.cmp(a));
        acks[acks.len() / 2]
    }

    /// Majority of members can no longer vote for `peer` in `term`: they
    /// either moved past `term` or answered it without choosing `peer`.
    pub fn is_major_reject(&self, peer: PeerId, term: u64) -> bool {
        let rejects = self
            .machines
            .values()
            .filter(|m| m.term > term || (m.term == term && m.candidate != Some(peer)))
            .count();
        self.is_majority(rejects)
    }

    /// Record that `peer` acknowledged a pending membership switch.
    pub fn confirm(&mut self, peer: PeerId) -> bool {
        if self.contains(peer) {
            self.confirmed.insert(peer)
        } else {
            false
        }
    }

    /// Majority of members acknowledged the pending membership switch.
    pub fn is_major_confirm(&self) -> bool {
        self.is_majority(self.confirmed.len())
    }

    pub fn clear_confirms(&mut self) {
        self.confirmed.clear();
    }

    /// Every peer that must hear a broadcast while `old` and `new` are both
    /// in force: their union, minus `self_peer`.
    pub fn join(self_peer: PeerId, old: &RaftGraph, new: &RaftGraph) -> BTreeMap<PeerId, RaftMachine> {
        let mut merged = BTreeMap::new();
        for machine in new.machines.values().chain(old.machines.values()) {
            if machine.peer != self_peer {
                merged.insert(machine.peer, machine.clone());
            }
        }
        merged
    }
}
