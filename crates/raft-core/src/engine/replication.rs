//! log replication: submission, append handling, commit advancement, apply

use tracing::{debug, error, info, warn};

use super::{RaftPeer, Submitted};
use crate::error::{RaftError, Result};
use crate::log::LogEntry;
use crate::message::{Accept, Append, Forward, Notify, RaftMessage, Reject, RejectCode};
use crate::node::{NodeState, RaftMachine};
use crate::storage::LogStore;
use crate::transport::{Application, Scheduler, Transport};
use crate::PeerId;

/// how a follower's log lined up with an append
enum CatchUp {
    /// logs agree up to this index
    Matched(u64),
    /// ask the leader to retry from this index + 1
    Conflict(u64),
    WalFailed,
}

impl<S, T, A, C> RaftPeer<S, T, A, C>
where
    S: LogStore,
    T: Transport,
    A: Application,
    C: Scheduler,
{
    /// Propose `content` to the cluster.
    ///
    /// On the leader the entry is appended locally and replicated; elsewhere
    /// it is forwarded to the known leader. Completion is reported through
    /// `Application::on_completed` on this peer once the entry commits, or
    /// `Application::on_rejected` when the peer it was forwarded to drops it.
    pub fn submit(&mut self, origin: u64, sub_serial: u32, content: Vec<u8>) -> Result<Submitted> {
        match self.me.state {
            NodeState::Leader => {
                let peer = self.me.peer;
                let entry = self.leader_append(peer, origin, sub_serial, content)?;
                Ok(Submitted::Appended {
                    index: entry.index,
                    term: entry.term,
                })
            }
            NodeState::Outside => Err(RaftError::IllegalState(NodeState::Outside)),
            _ => match self.me.leader {
                Some(leader) if leader != self.me.peer => {
                    let forward = Forward {
                        peer: self.me.peer,
                        origin,
                        sub_serial,
                        content,
                    };
                    self.send(leader, RaftMessage::Forward(forward));
                    Ok(Submitted::Forwarded { leader })
                }
                _ => Err(RaftError::NotLeader(None)),
            },
        }
    }

    fn leader_append(
        &mut self,
        client: PeerId,
        origin: u64,
        sub_serial: u32,
        content: Vec<u8>,
    ) -> Result<LogEntry> {
        let entry = LogEntry::new(self.me.term, self.me.index + 1, content)
            .with_origin(client, origin)
            .with_sub_serial(sub_serial);
        let index = entry.index;
        let reason = match self.store.append(entry.clone()) {
            Ok(true) => None,
            Ok(false) => Some(format!("store refused entry {}", index)),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = reason {
            error!(peer = self.me.peer, term = self.me.term, index, %reason, "leader append failed");
            self.refresh_from_store();
            self.step_down(self.me.term)?;
            return Err(RaftError::WalFailed { index, reason });
        }
        self.refresh_from_store();
        debug!(peer = self.me.peer, term = self.me.term, index, client, origin, "entry appended");

        // peers still catching up pick the entry up from their next accept
        let caught_up: Vec<PeerId> = self
            .next_index
            .iter()
            .filter(|(_, next)| **next == index)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in caught_up {
            self.send_append(peer)?;
        }
        self.advance_commit()?;
        Ok(entry)
    }

    pub(super) fn broadcast_append(&mut self) -> Result<()> {
        for peer in self.others() {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// send `peer` everything from its next index, or the snapshot when
    /// that part of the log is gone
    pub(super) fn send_append(&mut self, peer: PeerId) -> Result<()> {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.me.index + 1)
            .max(1);
        if next <= self.me.index && next < self.store.start_index() {
            return self.send_snapshot(peer);
        }
        let pre_index = next - 1;
        let pre_index_term = match self.store.term_at(pre_index)? {
            Some(term) => term,
            None => return self.send_snapshot(peer),
        };
        let entries = if next <= self.me.index {
            self.store.entries(next, self.config.max_batch)?
        } else {
            Vec::new()
        };
        let append = Append {
            term: self.me.term,
            leader: self.me.peer,
            commit: self.me.commit,
            pre_index,
            pre_index_term,
            entries,
        };
        self.send(peer, RaftMessage::Append(append));
        Ok(())
    }

    pub(super) fn on_append(&mut self, append: Append) -> Result<()> {
        let leader = append.leader;
        if !self.admit_leader(append.term, leader)? {
            return Ok(());
        }
        if self.incoming_snapshot.is_some() {
            // hold position until the snapshot lands
            let commit = self.me.commit;
            self.reply_accept(leader, commit)?;
            return Ok(());
        }
        match self.catch_up(&append)? {
            CatchUp::Matched(matched) => {
                self.follow_commit(append.commit, matched)?;
                self.reply_accept(leader, matched)
            }
            CatchUp::Conflict(reject_to) => {
                debug!(
                    peer = self.me.peer,
                    term = self.me.term,
                    pre_index = append.pre_index,
                    reject_to,
                    "append does not match local log"
                );
                self.reply_reject(leader, RejectCode::Conflict, reject_to);
                Ok(())
            }
            CatchUp::WalFailed => {
                self.reply_reject(leader, RejectCode::WalFailed, self.me.index);
                Ok(())
            }
        }
    }

    /// line the local log up with the leader's
    fn catch_up(&mut self, append: &Append) -> Result<CatchUp> {
        let pre_index = append.pre_index;
        if pre_index > self.me.index {
            return Ok(CatchUp::Conflict(self.me.index));
        }
        let start = self.store.start_index();
        // anything before the log start is committed and therefore matches
        if pre_index >= start && self.store.term_at(pre_index)? != Some(append.pre_index_term) {
            if pre_index <= self.me.commit {
                warn!(
                    peer = self.me.peer,
                    pre_index,
                    commit = self.me.commit,
                    "leader disagrees with a committed entry"
                );
                return Ok(CatchUp::Conflict(self.me.commit));
            }
            self.store.truncate_suffix(pre_index - 1)?;
            self.refresh_from_store();
            return Ok(CatchUp::Conflict(pre_index - 1));
        }

        let mut matched = pre_index;
        for entry in &append.entries {
            if entry.index < start {
                matched = entry.index;
                continue;
            }
            if entry.index <= self.me.index {
                if self.store.term_at(entry.index)? == Some(entry.term) {
                    matched = entry.index;
                    continue;
                }
                if entry.index <= self.me.commit {
                    warn!(peer = self.me.peer, index = entry.index, "leader rewrites a committed entry");
                    return Ok(CatchUp::Conflict(self.me.commit));
                }
                info!(
                    peer = self.me.peer,
                    term = self.me.term,
                    from = entry.index,
                    "dropping conflicting suffix"
                );
                self.store.truncate_suffix(entry.index - 1)?;
                self.refresh_from_store();
            }
            match self.store.append(entry.clone()) {
                Ok(true) => {
                    matched = entry.index;
                }
                Ok(false) => {
                    self.refresh_from_store();
                    return Ok(CatchUp::Conflict(self.me.index));
                }
                Err(e) => {
                    error!(peer = self.me.peer, index = entry.index, error = %e, "append failed");
                    self.refresh_from_store();
                    return Ok(CatchUp::WalFailed);
                }
            }
        }
        self.refresh_from_store();
        Ok(CatchUp::Matched(matched))
    }

    fn follow_commit(&mut self, leader_commit: u64, matched: u64) -> Result<()> {
        let commit = leader_commit.min(matched);
        if commit > self.me.commit {
            self.store.save_commit(commit)?;
            self.me.commit = commit;
            self.sync_self();
            self.apply_committed()?;
        }
        Ok(())
    }

    pub(super) fn reply_accept(&mut self, leader: PeerId, matched: u64) -> Result<()> {
        let index_term = self.store.term_at(matched)?.unwrap_or_default();
        let accept = Accept {
            term: self.me.term,
            peer: self.me.peer,
            index: matched,
            index_term,
            leader,
            commit: self.me.commit,
        };
        self.send(leader, RaftMessage::Accept(accept));
        Ok(())
    }

    pub(super) fn on_accept(&mut self, accept: Accept) -> Result<()> {
        if accept.term > self.me.term {
            return self.step_down(accept.term);
        }
        if self.me.state != NodeState::Leader || accept.term != self.me.term {
            return Ok(());
        }
        let peer = accept.peer;
        let known = self
            .graph
            .get(peer)
            .or_else(|| self.joint.as_ref().and_then(|j| j.get(peer)))
            .filter(|m| m.term == accept.term)
            .map_or(0, |m| m.match_index);
        // replies can arrive out of order; progress never moves back
        let matched = known.max(accept.index).min(self.me.index);
        self.record(RaftMachine {
            accept: matched,
            match_index: matched,
            ..RaftMachine::from(&accept)
        });
        self.next_index.insert(peer, matched + 1);
        self.advance_commit()?;
        if matched < self.me.index && self.me.state == NodeState::Leader {
            self.send_append(peer)?;
        }
        Ok(())
    }

    pub(super) fn on_reject(&mut self, reject: Reject) -> Result<()> {
        if reject.term > self.me.term {
            info!(
                peer = self.me.peer,
                term = self.me.term,
                from = reject.peer,
                newer = reject.term,
                "rejected by a newer term"
            );
            return self.step_down(reject.term);
        }
        match reject.code {
            RejectCode::LowerTerm | RejectCode::Obsolete | RejectCode::AlreadyVote => {
                self.on_vote_rejected(reject)
            }
            RejectCode::Conflict => {
                if self.me.state == NodeState::Leader && reject.term == self.me.term {
                    let next = (reject.reject_to + 1).clamp(1, self.me.index + 1);
                    self.next_index.insert(reject.peer, next);
                    self.send_append(reject.peer)?;
                }
                Ok(())
            }
            RejectCode::WalFailed => {
                warn!(peer = self.me.peer, from = reject.peer, "follower failed to persist, retrying later");
                Ok(())
            }
            RejectCode::SplitCluster => {
                warn!(
                    peer = self.me.peer,
                    term = self.me.term,
                    from = reject.peer,
                    "split cluster reported"
                );
                Ok(())
            }
            RejectCode::IllegalState => {
                debug!(peer = self.me.peer, from = reject.peer, "peer cannot take part");
                Ok(())
            }
        }
    }

    /// commit the highest index held by a majority of every graph in force,
    /// provided it belongs to the current term
    pub(super) fn advance_commit(&mut self) -> Result<()> {
        if self.me.state != NodeState::Leader {
            return Ok(());
        }
        let term = self.me.term;
        let mut quorum = self.graph.quorum_accept(term);
        if let Some(joint) = &self.joint {
            quorum = quorum.min(joint.quorum_accept(term));
        }
        if quorum <= self.me.commit || self.store.term_at(quorum)? != Some(term) {
            return Ok(());
        }
        self.store.save_commit(quorum)?;
        self.me.commit = quorum;
        self.sync_self();
        debug!(peer = self.me.peer, term, commit = quorum, "commit advanced");
        self.apply_committed()
    }

    /// hand newly committed entries to the application, in order
    pub(super) fn apply_committed(&mut self) -> Result<()> {
        let leading = self.me.state == NodeState::Leader;
        while self.applied < self.me.commit {
            let index = self.applied + 1;
            let entry = match self.store.get_entry(index)? {
                Some(entry) => entry,
                None => {
                    warn!(peer = self.me.peer, index, "committed entry missing from log");
                    break;
                }
            };
            self.app.on_committed(&entry);
            self.applied = index;
            if leading {
                self.notify_client(&entry);
            }
        }
        self.maybe_snapshot()
    }

    fn notify_client(&mut self, entry: &LogEntry) {
        if entry.client == self.me.peer {
            self.app.on_completed(entry.origin, entry.index);
        } else if entry.client != 0 {
            let notify = Notify {
                term: self.me.term,
                leader: self.me.peer,
                index: entry.index,
                origin: entry.origin,
                committed: true,
            };
            self.send(entry.client, RaftMessage::Notify(notify));
        }
    }

    pub(super) fn on_forward(&mut self, forward: Forward) -> Result<()> {
        let (client, origin) = (forward.peer, forward.origin);
        if self.me.state != NodeState::Leader {
            debug!(peer = self.me.peer, from = client, origin, "not leading, forward refused");
            self.refuse_forward(client, origin);
            return Ok(());
        }
        match self.leader_append(client, origin, forward.sub_serial, forward.content) {
            Ok(_) => Ok(()),
            Err(RaftError::WalFailed { .. }) => {
                self.refuse_forward(client, origin);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// tell `client` its operation never made it into a log
    pub(super) fn refuse_forward(&mut self, client: PeerId, origin: u64) {
        let notify = Notify {
            term: self.me.term,
            leader: self.me.peer,
            index: 0,
            origin,
            committed: false,
        };
        self.send(client, RaftMessage::Notify(notify));
    }

    pub(super) fn on_notify(&mut self, notify: Notify) -> Result<()> {
        if notify.committed {
            self.app.on_completed(notify.origin, notify.index);
        } else {
            info!(
                peer = self.me.peer,
                from = notify.leader,
                origin = notify.origin,
                "forwarded operation refused"
            );
            self.app.on_rejected(notify.origin);
        }
        Ok(())
    }
}
