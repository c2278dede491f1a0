// SPDX-License-Identifier: MIT OR Apache-2.0

//! Whole-room scenarios over the in-memory network and rendezvous

use std::sync::Arc;
use std::time::Duration;

use peerchat_core::{EntryLog, Role};
use peerchat_network::{Direction, MemoryNetwork, MemoryRendezvous, PeerId, SessionState};

mod common;
use common::*;

#[tokio::test]
async fn test_joiner_syncs_and_tails_writer() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let room = test_room();

    let a = TestPeer::open(&network, &rendezvous, &room, PeerId::random(), creator_log(&room, &["hi"])).await;
    assert_eq!(a.log.length(), 2);

    let b_log = Arc::new(EntryLog::new(room.chain_seed));
    let b = TestPeer::open(&network, &rendezvous, &room, PeerId::random(), b_log).await;

    wait_for_length(&b.log, 2).await;
    assert_eq!(b.log.snapshot(), a.log.snapshot());

    let mut tail = b.log.subscribe(2);
    a.log.append(Role::Assistant, "hello").unwrap();

    let entry = tokio::time::timeout(TIMEOUT, tail.next()).await.expect("live entry");
    assert_eq!(entry.sequence, 2);
    assert_eq!(entry.role, Role::Assistant);
    assert_eq!(entry.content, "hello");
    assert_eq!(b.log.last_digest(), a.log.last_digest());

    a.node.close().await.unwrap();
    b.node.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_fetches_only_missing_entries() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let room = test_room();

    let a = TestPeer::open(&network, &rendezvous, &room, PeerId::random(), creator_log(&room, &["hi"])).await;
    let b_id = PeerId::random();
    let b_log = Arc::new(EntryLog::new(room.chain_seed));

    let b = TestPeer::open(&network, &rendezvous, &room, b_id, Arc::clone(&b_log)).await;
    wait_for_length(&b_log, 2).await;
    b.node.close().await.unwrap();
    drop(b);
    wait_until(|| a.node.active_peers().is_empty(), "writer to drop the session").await;

    a.log.append(Role::User, "while you were away").unwrap();
    a.log.append(Role::Assistant, "noted").unwrap();
    assert_eq!(b_log.length(), 2);

    let mut tail = b_log.subscribe(2);
    let b = TestPeer::open(&network, &rendezvous, &room, b_id, Arc::clone(&b_log)).await;
    wait_for_length(&b_log, 4).await;
    assert_eq!(b_log.snapshot(), a.log.snapshot());

    // Subscribers see the gap filled in order
    assert_eq!(tail.next().await.content, "while you were away");
    assert_eq!(tail.next().await.content, "noted");

    a.node.close().await.unwrap();
    b.node.close().await.unwrap();
}

#[tokio::test]
async fn test_one_session_per_peer_pair() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let room = test_room();

    // Both sides learn about each other and dial at the same time
    let a = TestPeer::open(&network, &rendezvous, &room, PeerId::random(), creator_log(&room, &[])).await;
    let b = TestPeer::open(
        &network,
        &rendezvous,
        &room,
        PeerId::random(),
        Arc::new(EntryLog::new(room.chain_seed)),
    )
    .await;

    wait_for_length(&b.log, 1).await;
    wait_until(
        || {
            let (pa, pb) = (a.node.peers(), b.node.peers());
            pa.len() == 1
                && pb.len() == 1
                && pa[0].state == SessionState::Tailing
                && pb[0].state == SessionState::Tailing
        },
        "a single tailing session on each side",
    )
    .await;

    // Give a losing duplicate time to show up before checking again
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.node.active_peers(), vec![b.id]);
    assert_eq!(b.node.active_peers(), vec![a.id]);
    assert_ne!(a.node.peers()[0].direction, b.node.peers()[0].direction);
    assert!(a.node.peers()[0].connected_at.is_some());
    assert!(b.node.peers()[0].connected_at.is_some());
    let dialer = if a.node.peers()[0].direction == Direction::Outbound {
        a.node.peers()
    } else {
        b.node.peers()
    };
    assert!(dialer[0].attempts >= 1);

    a.node.close().await.unwrap();
    b.node.close().await.unwrap();
}

#[tokio::test]
async fn test_replica_serves_later_joiner() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let room = test_room();

    let a = TestPeer::open(&network, &rendezvous, &room, PeerId::random(), creator_log(&room, &["hi", "anyone?"])).await;
    let b = TestPeer::open(
        &network,
        &rendezvous,
        &room,
        PeerId::random(),
        Arc::new(EntryLog::new(room.chain_seed)),
    )
    .await;
    wait_for_length(&b.log, 3).await;

    // The writer leaves; the replica still has everything
    a.node.close().await.unwrap();
    drop(a);

    let c = TestPeer::open(
        &network,
        &rendezvous,
        &room,
        PeerId::random(),
        Arc::new(EntryLog::new(room.chain_seed)),
    )
    .await;
    wait_for_length(&c.log, 3).await;
    assert_eq!(c.log.snapshot(), b.log.snapshot());

    b.node.close().await.unwrap();
    c.node.close().await.unwrap();
}

#[tokio::test]
async fn test_other_rooms_stay_separate() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let room = test_room();
    let other = test_room();

    let a = TestPeer::open(&network, &rendezvous, &room, PeerId::random(), creator_log(&room, &["hi"])).await;
    let b = TestPeer::open(&network, &rendezvous, &other, PeerId::random(), creator_log(&other, &[])).await;
    assert_eq!(rendezvous.members(&room.topic), 1);
    assert_eq!(rendezvous.members(&other.topic), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.node.active_peers().is_empty());
    assert!(b.node.active_peers().is_empty());
    assert_eq!(b.log.length(), 1);

    a.node.close().await.unwrap();
    b.node.close().await.unwrap();
    assert_eq!(rendezvous.members(&room.topic), 0);
}

#[tokio::test]
async fn test_three_peers_converge() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let room = test_room();

    let a = TestPeer::open(&network, &rendezvous, &room, PeerId::random(), creator_log(&room, &["hi"])).await;
    let mut replicas = Vec::new();
    for _ in 0..2 {
        let log = Arc::new(EntryLog::new(room.chain_seed));
        replicas.push(TestPeer::open(&network, &rendezvous, &room, PeerId::random(), log).await);
    }

    for i in 0..5 {
        a.log.append(Role::User, format!("message {i}")).unwrap();
    }
    for replica in &replicas {
        wait_for_length(&replica.log, 7).await;
        assert_eq!(replica.log.snapshot(), a.log.snapshot());
    }

    for replica in &replicas {
        replica.node.close().await.unwrap();
    }
    a.node.close().await.unwrap();
}
