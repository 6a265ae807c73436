//! # test harness
//!
//! why: drive real peers deterministically, without threads or clocks
//! relations: shared by comprehensive_tests.rs and cluster_tests.rs
//! what: Outbox transport, ManualTimers scheduler, Recorder application, Cluster simulator

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use raft_core::message::{Append, VoteRequest};
use raft_core::{
    Application, Event, LogEntry, LogStore, MemLogStore, NodeState, PeerId, RaftConfig, RaftMessage,
    RaftPeer, Scheduler, Submitted, TaskHandle, TimerEvent, Transport,
};

// -- transport --

/// Collects outgoing messages until the harness routes them.
#[derive(Default)]
pub struct Outbox {
    pub sent: Vec<(PeerId, RaftMessage)>,
}

impl Transport for Outbox {
    type Session = PeerId;

    fn session_for(&self, peer: PeerId) -> Option<PeerId> {
        Some(peer)
    }

    fn send(&mut self, session: &PeerId, message: RaftMessage) {
        self.sent.push((*session, message));
    }
}

// -- timers --

/// Records armed timers; tests fire them by hand.
#[derive(Default)]
pub struct ManualTimers {
    armed: Vec<(TimerEvent, TaskHandle)>,
}

impl ManualTimers {
    pub fn pending(&self) -> Vec<TimerEvent> {
        self.armed
            .iter()
            .filter(|(_, handle)| handle.is_pending())
            .map(|(event, _)| *event)
            .collect()
    }

    fn arm(&mut self, event: TimerEvent) -> TaskHandle {
        self.armed.retain(|(_, handle)| handle.is_pending());
        let handle = TaskHandle::detached();
        self.armed.push((event, handle.clone()));
        handle
    }
}

impl Scheduler for ManualTimers {
    fn schedule(&mut self, _delay: Duration, event: TimerEvent) -> TaskHandle {
        self.arm(event)
    }

    fn schedule_repeat(&mut self, _period: Duration, event: TimerEvent) -> TaskHandle {
        self.arm(event)
    }
}

// -- application --

/// Keeps every committed entry; snapshots are the json of that list.
#[derive(Default)]
pub struct Recorder {
    pub committed: Vec<LogEntry>,
    pub completed: Vec<(u64, u64)>,
    pub rejected: Vec<u64>,
    pub restored: Option<u64>,
}

impl Recorder {
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.committed.iter().map(|e| e.content.clone()).collect()
    }
}

impl Application for Recorder {
    fn on_committed(&mut self, entry: &LogEntry) {
        self.committed.push(entry.clone());
    }

    fn on_completed(&mut self, origin: u64, index: u64) {
        self.completed.push((origin, index));
    }

    fn on_rejected(&mut self, origin: u64) {
        self.rejected.push(origin);
    }

    fn snapshot(&mut self, index: u64) -> Vec<u8> {
        let upto: Vec<&LogEntry> = self.committed.iter().filter(|e| e.index <= index).collect();
        serde_json::to_vec(&upto).unwrap()
    }

    fn restore(&mut self, index: u64, _term: u64, data: &[u8]) {
        self.committed = serde_json::from_slice(data).unwrap();
        self.restored = Some(index);
    }
}

pub type SimPeer = RaftPeer<MemLogStore, Outbox, Recorder, ManualTimers>;

// -- single peer helpers --

pub fn config(peer: PeerId, members: &[PeerId]) -> RaftConfig {
    RaftConfig::new(peer, members.to_vec())
}

pub fn spawn(config: RaftConfig, store: MemLogStore) -> SimPeer {
    let mut peer = SimPeer::new(
        config,
        store,
        Outbox::default(),
        Recorder::default(),
        ManualTimers::default(),
    )
    .unwrap();
    peer.start().unwrap();
    peer
}

pub fn solo(peer: PeerId, members: &[PeerId]) -> SimPeer {
    spawn(config(peer, members), MemLogStore::new())
}

/// everything the peer sent since the last drain
pub fn drain(peer: &mut SimPeer) -> Vec<(PeerId, RaftMessage)> {
    std::mem::take(&mut peer.transport_mut().sent)
}

pub fn deliver(peer: &mut SimPeer, message: RaftMessage) {
    peer.handle(Event::Message(message)).unwrap();
}

pub fn fire(peer: &mut SimPeer, event: TimerEvent) {
    peer.handle(Event::Timer(event)).unwrap();
}

pub fn entry(term: u64, index: u64) -> LogEntry {
    LogEntry::new(term, index, format!("{}:{}", term, index).into_bytes())
}

pub fn store_with(terms: &[u64]) -> MemLogStore {
    let mut store = MemLogStore::new();
    for (i, term) in terms.iter().enumerate() {
        assert!(store.append(entry(*term, i as u64 + 1)).unwrap());
    }
    if let Some(last) = terms.last() {
        store.save_term(*last, None).unwrap();
    }
    store
}

pub fn vote_request(term: u64, candidate: PeerId, index: u64, index_term: u64) -> RaftMessage {
    RaftMessage::VoteRequest(VoteRequest {
        term,
        candidate,
        index,
        index_term,
        accept: index,
        commit: 0,
    })
}

pub fn append(
    term: u64,
    leader: PeerId,
    pre_index: u64,
    pre_index_term: u64,
    commit: u64,
    entries: Vec<LogEntry>,
) -> RaftMessage {
    RaftMessage::Append(Append {
        term,
        leader,
        commit,
        pre_index,
        pre_index_term,
        entries,
    })
}

pub fn log_of(peer: &SimPeer) -> Vec<LogEntry> {
    let store = peer.store();
    store.entries(store.start_index(), usize::MAX).unwrap()
}

// -- cluster --

/// A set of peers exchanging messages through one FIFO queue.
pub struct Cluster {
    pub peers: BTreeMap<PeerId, SimPeer>,
    pub queue: VecDeque<(PeerId, PeerId, RaftMessage)>,
    down: BTreeSet<PeerId>,
    cut: BTreeSet<(PeerId, PeerId)>,
}

impl Cluster {
    pub fn new(ids: &[PeerId]) -> Self {
        Self::with_config(ids, |_| {})
    }

    pub fn with_config(ids: &[PeerId], tweak: impl Fn(&mut RaftConfig)) -> Self {
        let mut cluster = Self {
            peers: BTreeMap::new(),
            queue: VecDeque::new(),
            down: BTreeSet::new(),
            cut: BTreeSet::new(),
        };
        for id in ids {
            cluster.add(*id, ids, &tweak);
        }
        cluster
    }

    /// start another peer that believes the membership is `members`
    pub fn add(&mut self, id: PeerId, members: &[PeerId], tweak: impl Fn(&mut RaftConfig)) {
        let mut config = config(id, members);
        tweak(&mut config);
        self.peers.insert(id, spawn(config, MemLogStore::new()));
    }

    pub fn peer(&self, id: PeerId) -> &SimPeer {
        &self.peers[&id]
    }

    pub fn peer_mut(&mut self, id: PeerId) -> &mut SimPeer {
        self.peers.get_mut(&id).unwrap()
    }

    /// move every outgoing message into the queue
    pub fn collect(&mut self) {
        for (id, peer) in self.peers.iter_mut() {
            for (to, message) in peer.transport_mut().sent.drain(..) {
                self.queue.push_back((*id, to, message));
            }
        }
    }

    pub fn can_reach(&self, from: PeerId, to: PeerId) -> bool {
        !self.down.contains(&from)
            && !self.down.contains(&to)
            && !self.cut.contains(&(from, to))
            && self.peers.contains_key(&to)
    }

    pub fn deliver_one(&mut self, from: PeerId, to: PeerId, message: RaftMessage) {
        if self.can_reach(from, to) {
            deliver(self.peer_mut(to), message);
        }
        self.collect();
    }

    pub fn deliver_all(&mut self) {
        self.collect();
        let mut delivered = 0;
        while let Some((from, to, message)) = self.queue.pop_front() {
            delivered += 1;
            assert!(delivered < 100_000, "message storm");
            self.deliver_one(from, to, message);
        }
    }

    pub fn fire(&mut self, id: PeerId, event: TimerEvent) {
        if !self.down.contains(&id) {
            fire(self.peer_mut(id), event);
        }
        self.deliver_all();
    }

    pub fn heartbeat(&mut self, id: PeerId) {
        let term = self.peer(id).term();
        self.fire(id, TimerEvent::Heartbeat { term });
    }

    pub fn elect(&mut self, id: PeerId) {
        self.peer_mut(id).start_candidacy().unwrap();
        self.deliver_all();
        assert_eq!(self.peer(id).state(), NodeState::Leader, "peer {} should lead", id);
    }

    pub fn submit(&mut self, id: PeerId, content: &[u8]) -> Submitted {
        self.peer_mut(id).submit(0, 0, content.to_vec()).unwrap()
    }

    pub fn crash(&mut self, id: PeerId) {
        self.down.insert(id);
    }

    pub fn recover(&mut self, id: PeerId) {
        self.down.remove(&id);
    }

    /// cut every link between `id` and the rest
    pub fn isolate(&mut self, id: PeerId) {
        let others: Vec<PeerId> = self.peers.keys().copied().filter(|p| *p != id).collect();
        for other in others {
            self.cut.insert((id, other));
            self.cut.insert((other, id));
        }
    }

    pub fn heal(&mut self) {
        self.cut.clear();
    }

    /// rebuild a peer from its store alone, as after a process restart
    pub fn restart(&mut self, id: PeerId) {
        let peer = self.peers.remove(&id).unwrap();
        let config = peer.config().clone();
        let (store, _, _, _) = peer.into_parts();
        self.peers.insert(id, spawn(config, store));
    }

    pub fn leaders(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.state() == NodeState::Leader)
            .map(|p| p.id())
            .collect()
    }

    pub fn log(&self, id: PeerId) -> Vec<LogEntry> {
        log_of(self.peer(id))
    }

    pub fn payloads(&self, id: PeerId) -> Vec<Vec<u8>> {
        self.peer(id).app().payloads()
    }
}
