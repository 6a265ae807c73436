//! log compaction and snapshot transfer to lagging followers

use tracing::{debug, info, warn};

use super::{RaftPeer, SnapshotTransfer};
use crate::error::Result;
use crate::message::{InstallSnapshot, RaftMessage, RejectCode};
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
    /// Record a snapshot at the applied index once the log is large enough.
    pub(super) fn maybe_snapshot(&mut self) -> Result<()> {
        if self.store.total_bytes() < self.config.snapshot_min_bytes {
            return Ok(());
        }
        let applied = self.applied;
        let in_log = applied >= self.store.start_index() && applied <= self.store.end_index();
        if applied > self.me.commit || !in_log || applied <= self.store.snapshot_meta().commit {
            return Ok(());
        }
        let term = match self.store.term_at(applied)? {
            Some(term) => term,
            None => return Ok(()),
        };
        self.store.take_snapshot(applied, term)?;
        info!(
            peer = self.me.peer,
            index = applied,
            term,
            start = self.store.start_index(),
            "snapshot taken"
        );
        Ok(())
    }

    /// stream the application's state at the applied index to `peer`
    pub(super) fn send_snapshot(&mut self, peer: PeerId) -> Result<()> {
        let index = self.applied;
        let index_term = match self.store.term_at(index)? {
            Some(term) => term,
            None => {
                warn!(peer = self.me.peer, to = peer, index, "no term known for snapshot point");
                return Ok(());
            }
        };
        let data = self.app.snapshot(index);
        info!(
            peer = self.me.peer,
            to = peer,
            index,
            bytes = data.len(),
            "sending snapshot"
        );

        let chunk = self.config.snapshot_chunk_size;
        let mut offset = 0;
        loop {
            let end = (offset + chunk).min(data.len());
            let done = end == data.len();
            let install = InstallSnapshot {
                term: self.me.term,
                leader: self.me.peer,
                index,
                index_term,
                offset: offset as u64,
                data: data[offset..end].to_vec(),
                done,
            };
            self.send(peer, RaftMessage::InstallSnapshot(install));
            if done {
                return Ok(());
            }
            offset = end;
        }
    }

    pub(super) fn on_install_snapshot(&mut self, install: InstallSnapshot) -> Result<()> {
        let leader = install.leader;
        if !self.admit_leader(install.term, leader)? {
            return Ok(());
        }
        if install.index <= self.me.commit {
            self.incoming_snapshot = None;
            return self.reply_accept(leader, install.index);
        }

        if install.offset == 0 {
            self.incoming_snapshot = Some(SnapshotTransfer {
                leader,
                leader_term: install.term,
                index: install.index,
                term: install.index_term,
                data: Vec::new(),
            });
        }
        let in_order = matches!(
            &self.incoming_snapshot,
            Some(t) if t.index == install.index
                && t.term == install.index_term
                && t.data.len() as u64 == install.offset
        );
        if !in_order {
            debug!(
                peer = self.me.peer,
                index = install.index,
                offset = install.offset,
                "snapshot chunk out of order"
            );
            self.incoming_snapshot = None;
            let index = self.me.index;
            self.reply_reject(leader, RejectCode::Conflict, index);
            return Ok(());
        }
        if let Some(transfer) = self.incoming_snapshot.as_mut() {
            transfer.data.extend_from_slice(&install.data);
        }
        if !install.done {
            return Ok(());
        }

        let transfer = match self.incoming_snapshot.take() {
            Some(transfer) => transfer,
            None => return Ok(()),
        };
        self.app.restore(transfer.index, transfer.term, &transfer.data);
        self.store.install_snapshot(transfer.index, transfer.term)?;
        self.refresh_from_store();
        self.applied = transfer.index;
        info!(
            peer = self.me.peer,
            index = transfer.index,
            term = transfer.term,
            "snapshot installed"
        );
        self.reply_accept(leader, transfer.index)
    }
}
