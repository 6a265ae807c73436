//! # cluster raft tests
//!
//! why: verify the safety properties of a whole cluster, not just one peer
//! relations: several RaftPeers wired through the simulated queue in common/
//! what: election safety, failover, partitions, membership, snapshot catch-up, restart, random schedules

mod common;

use std::collections::BTreeMap;

use common::*;
use raft_core::message::InstallSnapshot;
use raft_core::{LogEntry, LogStore, NodeState, PeerId, RaftMessage, TimerEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn terms(log: &[LogEntry]) -> Vec<u64> {
    log.iter().map(|e| e.term).collect()
}

// =============================================================================
// SECTION 1: ELECTION SAFETY
// =============================================================================

mod election_safety {
    use super::*;

    #[test]
    fn concurrent_candidates_elect_one_leader() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.peer_mut(2).start_candidacy().unwrap();
        cluster.peer_mut(3).start_candidacy().unwrap();
        cluster.deliver_all();

        assert_eq!(cluster.leaders(), vec![2]);
        assert_eq!(cluster.peer(3).state(), NodeState::Follower);
        assert_eq!(cluster.peer(3).leader(), Some(2));
        assert_eq!(cluster.peer(1).leader(), Some(2));
    }

    #[test]
    fn isolated_leader_is_replaced_and_steps_down() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        cluster.submit(1, b"a");
        cluster.deliver_all();
        cluster.heartbeat(1);

        cluster.isolate(1);
        cluster.submit(1, b"lost");
        cluster.deliver_all();
        cluster.elect(2);
        cluster.submit(2, b"b");
        cluster.deliver_all();
        assert_eq!(cluster.peer(2).commit(), 2);

        cluster.heal();
        cluster.heartbeat(1);
        assert_eq!(cluster.peer(1).state(), NodeState::Follower);
        assert_eq!(cluster.peer(1).term(), 2);

        cluster.heartbeat(2);
        assert_eq!(cluster.leaders(), vec![2]);
        for id in [1, 2, 3] {
            assert_eq!(cluster.log(id), cluster.log(2));
            assert_eq!(cluster.payloads(id), vec![b"a".to_vec(), b"b".to_vec()]);
        }
    }
}

// =============================================================================
// SECTION 2: FAILOVER
// =============================================================================

mod failover {
    use super::*;

    #[test]
    fn leader_failover_preserves_committed_entries() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        for i in 1..=5 {
            cluster.submit(1, format!("e{}", i).as_bytes());
        }
        cluster.deliver_all();
        cluster.heartbeat(1);
        for id in [1, 2, 3] {
            assert_eq!(cluster.peer(id).commit(), 5);
        }

        cluster.crash(1);
        cluster.elect(2);
        assert_eq!(cluster.peer(2).term(), 2);
        for i in 6..=8 {
            cluster.submit(2, format!("e{}", i).as_bytes());
        }
        cluster.deliver_all();
        cluster.heartbeat(2);
        assert_eq!(cluster.peer(2).commit(), 8);
        assert_eq!(cluster.peer(3).commit(), 8);

        // the old leader rejoins and converges
        cluster.recover(1);
        cluster.heartbeat(2);
        let expected: Vec<Vec<u8>> = (1..=8).map(|i| format!("e{}", i).into_bytes()).collect();
        for id in [1, 2, 3] {
            assert_eq!(cluster.payloads(id), expected);
            assert_eq!(terms(&cluster.log(id)), vec![1, 1, 1, 1, 1, 2, 2, 2]);
        }
        assert_eq!(cluster.peer(1).state(), NodeState::Follower);
    }

    #[test]
    fn restarted_peer_keeps_term_vote_and_log() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        cluster.submit(1, b"a");
        cluster.submit(1, b"b");
        cluster.deliver_all();
        cluster.heartbeat(1);

        cluster.restart(2);
        let peer = cluster.peer(2);
        assert_eq!(peer.state(), NodeState::Follower);
        assert_eq!(peer.term(), 1);
        assert_eq!(peer.machine().candidate, Some(1));
        assert_eq!(peer.commit(), 2);
        assert_eq!(cluster.log(2).len(), 2);
        // committed entries are replayed to the fresh application
        assert_eq!(cluster.payloads(2), vec![b"a".to_vec(), b"b".to_vec()]);

        cluster.submit(1, b"c");
        cluster.deliver_all();
        cluster.heartbeat(1);
        assert_eq!(cluster.payloads(2).len(), 3);
    }
}

// =============================================================================
// SECTION 3: MEMBERSHIP
// =============================================================================

mod membership {
    use super::*;

    #[test]
    fn add_member_through_joint_consensus() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.add(4, &[1, 2, 3], |_| {});
        assert_eq!(cluster.peer(4).state(), NodeState::Client);

        cluster.elect(1);
        cluster.submit(1, b"before");
        cluster.deliver_all();

        cluster.peer_mut(1).change_membership(vec![1, 2, 3, 4]).unwrap();
        cluster.deliver_all();

        assert_eq!(cluster.peer(1).effective_state(), NodeState::Leader);
        assert_eq!(cluster.peer(4).state(), NodeState::Follower);
        for id in [1, 2, 3, 4] {
            assert_eq!(cluster.peer(id).graph().members(), vec![1, 2, 3, 4]);
            assert!(cluster.peer(id).joint_graph().is_none());
        }

        cluster.submit(1, b"after");
        cluster.deliver_all();
        cluster.heartbeat(1);
        for id in [1, 2, 3, 4] {
            assert_eq!(cluster.payloads(id), vec![b"before".to_vec(), b"after".to_vec()]);
        }
    }

    #[test]
    fn removed_member_leaves_and_quorum_shrinks() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        cluster.peer_mut(1).change_membership(vec![1, 2]).unwrap();
        cluster.deliver_all();

        assert_eq!(cluster.peer(3).state(), NodeState::Outside);
        assert_eq!(cluster.peer(1).graph().members(), vec![1, 2]);

        cluster.submit(1, b"x");
        cluster.deliver_all();
        assert_eq!(cluster.peer(1).commit(), 1);
        assert_eq!(cluster.peer(3).commit(), 0);
    }
}

// =============================================================================
// SECTION 4: SNAPSHOT CATCH-UP
// =============================================================================

mod snapshot_catch_up {
    use super::*;

    /// heartbeat from `leader`, losing every chunk to `to` that `lose` picks
    fn heartbeat_losing(
        cluster: &mut Cluster,
        leader: PeerId,
        to: PeerId,
        mut lose: impl FnMut(&InstallSnapshot) -> bool,
    ) {
        let term = cluster.peer(leader).term();
        fire(cluster.peer_mut(leader), TimerEvent::Heartbeat { term });
        cluster.collect();
        while let Some((from, dest, message)) = cluster.queue.pop_front() {
            let lost = match &message {
                RaftMessage::InstallSnapshot(install) => dest == to && lose(install),
                _ => false,
            };
            if !lost {
                cluster.deliver_one(from, dest, message);
            }
        }
    }

    fn compacted_leader_with_lagging_peer(cluster: &mut Cluster) {
        cluster.elect(1);
        cluster.crash(3);
        for i in 1..=4 {
            cluster.submit(1, format!("s{}", i).as_bytes());
            cluster.deliver_all();
        }
        assert_eq!(cluster.peer(1).commit(), 4);
        assert!(cluster.peer(1).store().start_index() > 1);
        cluster.recover(3);
    }

    #[test]
    fn lost_chunk_restarts_the_transfer() {
        let mut cluster = Cluster::with_config(&[1, 2, 3], |c| {
            c.snapshot_min_bytes = 1;
            c.snapshot_chunk_size = 16;
        });
        compacted_leader_with_lagging_peer(&mut cluster);

        let mut dropped = false;
        heartbeat_losing(&mut cluster, 1, 3, |install| {
            let lose = !dropped && install.offset > 0;
            dropped |= lose;
            lose
        });
        assert!(dropped);
        assert_eq!(cluster.peer(3).app().restored, Some(4));
        assert_eq!(cluster.peer(3).commit(), 4);
        assert_eq!(cluster.payloads(3), cluster.payloads(1));
    }

    #[test]
    fn transfer_from_crashed_leader_does_not_block_the_next() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        // only the first leader compacts, its successor still holds the whole log
        cluster.add(1, &[1, 2, 3], |c| {
            c.snapshot_min_bytes = 1;
            c.snapshot_chunk_size = 16;
        });
        compacted_leader_with_lagging_peer(&mut cluster);
        assert_eq!(cluster.peer(2).store().start_index(), 1);

        heartbeat_losing(&mut cluster, 1, 3, |install| install.offset > 0);
        assert_eq!(cluster.peer(3).app().restored, None);
        assert!(cluster.log(3).is_empty());

        cluster.crash(1);
        cluster.elect(2);
        assert_eq!(cluster.peer(3).leader(), Some(2));
        assert_eq!(cluster.log(3).len(), 4);
        assert_eq!(cluster.peer(3).commit(), 4);
        assert_eq!(cluster.peer(3).app().restored, None);
        assert_eq!(cluster.payloads(3), cluster.payloads(2));
    }

    #[test]
    fn lagging_follower_catches_up_from_snapshot() {
        let mut cluster = Cluster::with_config(&[1, 2, 3], |c| {
            c.snapshot_min_bytes = 1;
            c.snapshot_chunk_size = 16;
        });
        cluster.elect(1);
        cluster.crash(3);
        for i in 1..=4 {
            cluster.submit(1, format!("s{}", i).as_bytes());
            cluster.deliver_all();
        }
        assert_eq!(cluster.peer(1).commit(), 4);
        assert!(cluster.peer(1).store().start_index() > 1);

        cluster.recover(3);
        cluster.heartbeat(1);
        assert_eq!(cluster.peer(3).app().restored, Some(4));
        assert_eq!(cluster.peer(3).commit(), 4);
        assert_eq!(cluster.peer(3).store().start_index(), 5);
        assert_eq!(cluster.payloads(3), cluster.payloads(1));

        // and replicates normally afterwards
        cluster.submit(1, b"s5");
        cluster.deliver_all();
        cluster.heartbeat(1);
        assert_eq!(cluster.peer(3).commit(), 5);
        assert_eq!(cluster.payloads(3), cluster.payloads(1));
    }
}

// =============================================================================
// SECTION 5: RANDOMIZED SCHEDULES
// =============================================================================

mod randomized {
    use super::*;

    #[derive(Default)]
    struct Observed {
        leaders: BTreeMap<u64, PeerId>,
        commits: BTreeMap<PeerId, u64>,
        /// index -> (entry, lowest term at which any peer saw it committed)
        committed: BTreeMap<u64, (LogEntry, u64)>,
    }

    fn check(cluster: &Cluster, seen: &mut Observed) {
        for (id, peer) in &cluster.peers {
            if peer.state() == NodeState::Leader {
                let first = *seen.leaders.entry(peer.term()).or_insert(*id);
                assert_eq!(first, *id, "two leaders in term {}", peer.term());
            }

            let last = seen.commits.entry(*id).or_insert(0);
            assert!(peer.commit() >= *last, "commit of {} moved back", id);
            *last = peer.commit();

            let log = log_of(peer);
            for entry in log.iter().take(peer.commit() as usize) {
                let (known, term) = seen
                    .committed
                    .entry(entry.index)
                    .or_insert((entry.clone(), peer.term()));
                assert_eq!(&*known, entry, "committed entry {} differs on {}", entry.index, id);
                *term = (*term).min(peer.term());
            }
            for applied in &peer.app().committed {
                assert_eq!(&seen.committed[&applied.index].0, applied);
            }
        }

        let logs: Vec<Vec<LogEntry>> = cluster.peers.values().map(log_of).collect();
        for a in &logs {
            for b in &logs {
                let common = a.len().min(b.len());
                if let Some(k) = (0..common).rev().find(|k| a[*k].term == b[*k].term) {
                    assert_eq!(&a[..=k], &b[..=k], "logs agree at {} but not before", k + 1);
                }
            }
        }

        for peer in cluster.peers.values().filter(|p| p.state() == NodeState::Leader) {
            for (index, (entry, term)) in &seen.committed {
                if peer.term() > *term {
                    let held = peer.store().get_entry(*index).unwrap();
                    assert_eq!(held.as_ref(), Some(entry), "leader {} lost entry {}", peer.id(), index);
                }
            }
        }
    }

    fn run(seed: u64, steps: usize) {
        let ids: [PeerId; 5] = [1, 2, 3, 4, 5];
        let mut rng = StdRng::seed_from_u64(seed);
        let mut cluster = Cluster::new(&ids);
        let mut seen = Observed::default();
        let mut serial = 0u64;

        for _ in 0..steps {
            let roll = rng.gen_range(0..100);
            let pending = cluster.queue.len();
            match roll {
                0..=49 if pending > 0 => {
                    let pick = rng.gen_range(0..pending);
                    if let Some((from, to, message)) = cluster.queue.remove(pick) {
                        cluster.deliver_one(from, to, message);
                    }
                }
                50..=57 if pending > 0 => {
                    let pick = rng.gen_range(0..pending);
                    cluster.queue.remove(pick);
                }
                58..=61 if pending > 0 => {
                    let pick = rng.gen_range(0..pending);
                    if let Some(copy) = cluster.queue.get(pick).cloned() {
                        cluster.queue.push_back(copy);
                    }
                }
                62..=79 => {
                    let id = ids[rng.gen_range(0..ids.len())];
                    let peer = cluster.peer_mut(id);
                    let event = match peer.state() {
                        NodeState::Leader => TimerEvent::Heartbeat { term: peer.term() },
                        NodeState::Candidate => TimerEvent::Election { term: peer.term() },
                        _ => TimerEvent::NoHeartbeat,
                    };
                    fire(peer, event);
                    cluster.collect();
                }
                80..=91 => {
                    let id = ids[rng.gen_range(0..ids.len())];
                    serial += 1;
                    let _ = cluster
                        .peer_mut(id)
                        .submit(serial, 0, format!("op{}", serial).into_bytes());
                    cluster.collect();
                }
                92..=95 => {
                    let id = ids[rng.gen_range(0..ids.len())];
                    cluster.isolate(id);
                }
                96..=99 => cluster.heal(),
                _ => {}
            }
            check(&cluster, &mut seen);
        }
    }

    #[test]
    fn safety_holds_under_random_schedules() {
        for seed in 0..8 {
            run(seed, 1500);
        }
    }
}
