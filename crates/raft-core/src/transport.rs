//! # transport
//!
//! why: keep the engine free of sockets, threads and application logic
//! relations: engine/ is generic over these traits; runtime.rs wires them to a thread and a TimingWheel
//! what: Transport, Application and Scheduler seams plus the timer events they carry

use std::time::Duration;

use raft_timer::TaskHandle;

use crate::log::LogEntry;
use crate::message::RaftMessage;
use crate::PeerId;

/// Delivery of protocol messages to other peers.
///
/// Delivery is best effort: messages may be dropped, duplicated or
/// reordered and the engine copes with all three.
pub trait Transport {
    type Session;

    /// an open session to `peer`, if one can be had right now
    fn session_for(&self, peer: PeerId) -> Option<Self::Session>;

    fn send(&mut self, session: &Self::Session, message: RaftMessage);

    /// resolve and send; false when no session exists
    fn send_to_peer(&mut self, peer: PeerId, message: RaftMessage) -> bool {
        match self.session_for(peer) {
            Some(session) => {
                self.send(&session, message);
                true
            }
            None => false,
        }
    }
}

/// The replicated state machine driven by committed entries.
pub trait Application {
    /// called exactly once per committed entry on a running peer, in index order
    fn on_committed(&mut self, entry: &LogEntry);

    /// called on the submitting peer once its entry is committed
    fn on_completed(&mut self, _origin: u64, _index: u64) {}

    /// called on the submitting peer when a forwarded operation was dropped;
    /// the caller may submit it again
    fn on_rejected(&mut self, _origin: u64) {}

    /// serialized state covering every entry up to `index`
    fn snapshot(&mut self, _index: u64) -> Vec<u8> {
        Vec::new()
    }

    /// replace local state with a snapshot taken at (`index`, `term`)
    fn restore(&mut self, _index: u64, _term: u64, _data: &[u8]) {}
}

/// Timers the engine arms; each firing comes back as `Event::Timer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// candidate did not win `term` in time
    Election { term: u64 },
    /// leader of `term` should replicate
    Heartbeat { term: u64 },
    /// follower check that a leader was heard since the last tick
    NoHeartbeat,
}

pub trait Scheduler {
    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TaskHandle;

    fn schedule_repeat(&mut self, period: Duration, event: TimerEvent) -> TaskHandle;
}
