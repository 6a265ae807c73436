//! # runtime
//!
//! why: run a RaftPeer on its own thread with real timers
//! relations: owns an engine::RaftPeer; timers come from raft_timer::TimingWheel; transports deliver through Mailbox
//! what: spawn_peer, PeerHandle, Mailbox, WheelScheduler, PeerStatus
//!
//! The worker thread owns the peer and drains one channel. Timer firings,
//! inbound messages and client requests all arrive on that channel, so the
//! engine never sees concurrent calls.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use raft_timer::{TaskHandle, TimingWheel};
use tracing::{debug, info, warn};

use crate::config::RaftConfig;
use crate::engine::{Event, RaftPeer, Submitted};
use crate::error::{RaftError, Result};
use crate::message::RaftMessage;
use crate::node::NodeState;
use crate::storage::LogStore;
use crate::transport::{Application, Scheduler, TimerEvent, Transport};
use crate::PeerId;

/// Point-in-time view of a running peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer: PeerId,
    /// reports `Joint` during a membership change
    pub state: NodeState,
    pub term: u64,
    pub leader: Option<PeerId>,
    pub index: u64,
    pub commit: u64,
    pub applied: u64,
}

enum Command {
    Event(Event),
    Submit {
        origin: u64,
        sub_serial: u32,
        content: Vec<u8>,
        respond_to: Sender<Result<Submitted>>,
    },
    ChangeMembership {
        members: Vec<PeerId>,
        respond_to: Sender<Result<()>>,
    },
    Status {
        respond_to: Sender<PeerStatus>,
    },
    Shutdown,
}

/// Cheap, cloneable inbox of a running peer, for transports.
#[derive(Clone)]
pub struct Mailbox {
    queue: Sender<Command>,
}

impl Mailbox {
    /// false once the peer has stopped
    pub fn deliver(&self, message: RaftMessage) -> bool {
        self.queue.send(Command::Event(Event::Message(message))).is_ok()
    }
}

/// Scheduler whose timers post `Event::Timer` back into the peer's inbox.
pub struct WheelScheduler {
    wheel: Arc<TimingWheel>,
    queue: Sender<Command>,
}

impl Scheduler for WheelScheduler {
    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TaskHandle {
        let queue = self.queue.clone();
        self.wheel.schedule(delay, move || {
            let _ = queue.send(Command::Event(Event::Timer(event)));
        })
    }

    fn schedule_repeat(&mut self, period: Duration, event: TimerEvent) -> TaskHandle {
        let queue = self.queue.clone();
        self.wheel.schedule_repeat(period, move || {
            let _ = queue.send(Command::Event(Event::Timer(event)));
        })
    }
}

/// Handle to a peer running on its own thread.
pub struct PeerHandle {
    peer: PeerId,
    queue: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.peer
    }

    pub fn mailbox(&self) -> Mailbox {
        Mailbox {
            queue: self.queue.clone(),
        }
    }

    pub fn deliver(&self, message: RaftMessage) -> Result<()> {
        self.queue
            .send(Command::Event(Event::Message(message)))
            .map_err(|_| RaftError::Shutdown)
    }

    /// Propose `content`; blocks until the peer appended or forwarded it.
    pub fn submit(&self, origin: u64, sub_serial: u32, content: Vec<u8>) -> Result<Submitted> {
        let (respond_to, response) = unbounded();
        self.queue
            .send(Command::Submit {
                origin,
                sub_serial,
                content,
                respond_to,
            })
            .map_err(|_| RaftError::Shutdown)?;
        response.recv().map_err(|_| RaftError::Shutdown)?
    }

    pub fn change_membership(&self, members: Vec<PeerId>) -> Result<()> {
        let (respond_to, response) = unbounded();
        self.queue
            .send(Command::ChangeMembership { members, respond_to })
            .map_err(|_| RaftError::Shutdown)?;
        response.recv().map_err(|_| RaftError::Shutdown)?
    }

    pub fn status(&self) -> Result<PeerStatus> {
        let (respond_to, response) = unbounded();
        self.queue
            .send(Command::Status { respond_to })
            .map_err(|_| RaftError::Shutdown)?;
        response.recv().map_err(|_| RaftError::Shutdown)
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.queue.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(peer = self.peer, "peer worker panicked");
            }
        }
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start a peer on a dedicated thread, with timers driven by `wheel`.
pub fn spawn_peer<S, T, A>(
    config: RaftConfig,
    store: S,
    transport: T,
    app: A,
    wheel: Arc<TimingWheel>,
) -> Result<PeerHandle>
where
    S: LogStore + Send + 'static,
    T: Transport + Send + 'static,
    A: Application + Send + 'static,
{
    let peer_id = config.peer;
    let (queue, inbox) = unbounded();
    let scheduler = WheelScheduler {
        wheel,
        queue: queue.clone(),
    };
    let peer = RaftPeer::new(config, store, transport, app, scheduler)?;
    let worker = thread::Builder::new()
        .name(format!("raft-peer-{}", peer_id))
        .spawn(move || run(peer, inbox))?;
    Ok(PeerHandle {
        peer: peer_id,
        queue,
        worker: Some(worker),
    })
}

fn run<S, T, A>(mut peer: RaftPeer<S, T, A, WheelScheduler>, inbox: Receiver<Command>)
where
    S: LogStore,
    T: Transport,
    A: Application,
{
    if let Err(e) = peer.start() {
        warn!(peer = peer.id(), error = %e, "peer failed to start");
        return;
    }
    for command in inbox.iter() {
        match command {
            Command::Event(event) => {
                if let Err(e) = peer.handle(event) {
                    warn!(peer = peer.id(), error = %e, "event failed");
                }
            }
            Command::Submit {
                origin,
                sub_serial,
                content,
                respond_to,
            } => {
                let _ = respond_to.send(peer.submit(origin, sub_serial, content));
            }
            Command::ChangeMembership { members, respond_to } => {
                let _ = respond_to.send(peer.change_membership(members));
            }
            Command::Status { respond_to } => {
                let machine = peer.machine();
                let status = PeerStatus {
                    peer: machine.peer,
                    state: peer.effective_state(),
                    term: machine.term,
                    leader: machine.leader,
                    index: machine.index,
                    commit: machine.commit,
                    applied: peer.applied(),
                };
                let _ = respond_to.send(status);
            }
            Command::Shutdown => {
                debug!(peer = peer.id(), "shutdown requested");
                break;
            }
        }
    }
    peer.stop();
    info!(peer = peer.id(), "peer worker exited");
}
