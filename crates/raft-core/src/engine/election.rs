//! leader election: candidacy, vote granting, ballot counting

use tracing::{debug, info};

use super::RaftPeer;
use crate::error::{RaftError, Result};
use crate::message::{Ballot, RaftMessage, Reject, RejectCode, VoteRequest};
use crate::node::{NodeState, RaftMachine};
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
    /// Move to the next term, vote for ourselves and ask every other member for a vote.
    pub fn start_candidacy(&mut self) -> Result<()> {
        if !self.is_voting_member() || self.me.state == NodeState::Leader {
            return Err(RaftError::IllegalState(self.me.state));
        }
        self.me.term += 1;
        self.me.state = NodeState::Candidate;
        self.me.candidate = Some(self.me.peer);
        self.me.leader = None;
        self.persist_term()?;

        self.cancel_no_heartbeat();
        self.cancel_heartbeat();
        self.next_index.clear();
        self.sync_self();
        info!(
            peer = self.me.peer,
            term = self.me.term,
            index = self.me.index,
            commit = self.me.commit,
            "starting election"
        );

        let request = RaftMessage::VoteRequest(self.me.vote_request());
        self.broadcast(&request);
        self.start_election_timer();
        self.try_win_election()
    }

    pub(super) fn on_vote_request(&mut self, request: VoteRequest) -> Result<()> {
        let from = request.candidate;
        if !self.is_voting_member() {
            self.reply_reject(from, RejectCode::IllegalState, 0);
            return Ok(());
        }
        if request.term < self.me.term {
            self.reply_reject(from, RejectCode::LowerTerm, 0);
            return Ok(());
        }
        if request.term > self.me.term {
            self.step_down(request.term)?;
        }
        if self.me.state == NodeState::Candidate {
            // a rival's self-vote counts against us
            self.record(RaftMachine::from(&request));
        }

        match self.me.candidate {
            Some(voted) if voted == from => self.send_ballot(from),
            Some(voted) => {
                debug!(peer = self.me.peer, term = self.me.term, voted, candidate = from, "vote already cast");
                self.reply_reject(from, RejectCode::AlreadyVote, 0);
                self.try_lose_election();
            }
            None if self
                .me
                .is_covered_by(request.index, request.index_term, request.accept, request.commit) =>
            {
                self.me.candidate = Some(from);
                self.me.state = NodeState::Elector;
                self.persist_term()?;
                self.heard_from_leader = true;
                self.sync_self();
                info!(peer = self.me.peer, term = self.me.term, candidate = from, "vote granted");
                self.send_ballot(from);
            }
            None => {
                info!(
                    peer = self.me.peer,
                    term = self.me.term,
                    candidate = from,
                    "candidate log is behind ours"
                );
                self.reply_reject(from, RejectCode::Obsolete, 0);
                if self.me.state == NodeState::Follower {
                    self.start_candidacy()?;
                }
            }
        }
        Ok(())
    }

    fn send_ballot(&mut self, candidate: PeerId) {
        let ballot = Ballot {
            term: self.me.term,
            peer: self.me.peer,
            index: self.me.index,
            index_term: self.me.index_term,
            accept: self.me.accept,
            commit: self.me.commit,
            candidate,
        };
        self.send(candidate, RaftMessage::Ballot(ballot));
    }

    pub(super) fn on_ballot(&mut self, ballot: Ballot) -> Result<()> {
        if ballot.term > self.me.term {
            return self.step_down(ballot.term);
        }
        if self.me.state != NodeState::Candidate
            || ballot.term != self.me.term
            || ballot.candidate != self.me.peer
        {
            return Ok(());
        }
        self.record(RaftMachine::from(&ballot));
        self.try_win_election()
    }

    /// a vote was refused; `reject.term` is never above ours here
    pub(super) fn on_vote_rejected(&mut self, reject: Reject) -> Result<()> {
        if self.me.state != NodeState::Candidate || reject.term != self.me.term {
            return Ok(());
        }
        debug!(
            peer = self.me.peer,
            term = self.me.term,
            from = reject.peer,
            code = ?reject.code,
            "vote refused"
        );
        self.record(RaftMachine::from(&reject));
        self.try_lose_election();
        Ok(())
    }

    fn try_win_election(&mut self) -> Result<()> {
        if self.me.state != NodeState::Candidate {
            return Ok(());
        }
        let (peer, term) = (self.me.peer, self.me.term);
        let won = self.graph.is_major_accept(peer, term)
            && self.joint.as_ref().map_or(true, |j| j.is_major_accept(peer, term));
        if won {
            self.become_leader()?;
        }
        Ok(())
    }

    /// give up on this term once a majority can no longer vote for us;
    /// our own vote stays cast
    fn try_lose_election(&mut self) {
        if self.me.state != NodeState::Candidate {
            return;
        }
        let (peer, term) = (self.me.peer, self.me.term);
        let lost = self.graph.is_major_reject(peer, term)
            || self.joint.as_ref().map_or(false, |j| j.is_major_reject(peer, term));
        if lost {
            info!(peer, term, "election lost");
            self.me.state = NodeState::Follower;
            self.cancel_election();
            self.heard_from_leader = false;
            self.start_no_heartbeat();
            self.sync_self();
        }
    }

    fn become_leader(&mut self) -> Result<()> {
        let peer = self.me.peer;
        self.me.state = NodeState::Leader;
        self.me.leader = Some(peer);
        self.cancel_election();
        self.cancel_no_heartbeat();

        self.graph.reset_progress(peer);
        if let Some(joint) = self.joint.as_mut() {
            joint.reset_progress(peer);
        }
        let next = self.me.index + 1;
        self.next_index = self.others().into_iter().map(|p| (p, next)).collect();
        self.sync_self();
        info!(peer, term = self.me.term, index = self.me.index, commit = self.me.commit, "became leader");

        self.start_heartbeat();
        if self.joint.is_some() {
            self.resume_membership_change()?;
        }
        self.broadcast_append()?;
        self.advance_commit()
    }
}
