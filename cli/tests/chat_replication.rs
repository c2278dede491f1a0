// SPDX-License-Identifier: MIT OR Apache-2.0

//! A writer's conversation reaches a replica in the same room

use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

use peerchat_cli::{render, ChatOrchestrator, CompletionBackend, Turn, SYSTEM_PROMPT};
use peerchat_core::{ChatMessage, EntryLog, Role, RoomIdentity, RoomKey};
use peerchat_network::config::NodeConfig;
use peerchat_network::{MemoryNetwork, MemoryRendezvous, PeerId, RoomNode, Transport};

struct CannedBackend;

impl CompletionBackend for CannedBackend {
    fn complete<'a>(&'a self, messages: &'a [ChatMessage]) -> BoxFuture<'a, Result<String>> {
        let turns = messages.iter().filter(|m| m.role == Role::User).count();
        Box::pin(async move { Ok(format!("reply #{turns}")) })
    }
}

async fn open_node(
    network: &MemoryNetwork,
    rendezvous: &MemoryRendezvous,
    room: &RoomIdentity,
    log: Arc<EntryLog>,
) -> RoomNode<peerchat_network::MemoryTransport> {
    let id = PeerId::random();
    let transport = network.bind();
    let discovery = Arc::new(rendezvous.discovery(id, transport.local_addr()));
    RoomNode::open(id, room.clone(), log, transport, discovery, &NodeConfig::default())
        .await
        .expect("node should open")
}

#[tokio::test]
async fn test_replica_renders_writer_conversation() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let key = RoomKey::generate();
    let room = RoomIdentity::derive(&key);

    let writer_log = Arc::new(EntryLog::new(room.chain_seed));
    let writer = ChatOrchestrator::writer(Arc::clone(&writer_log), CannedBackend, 30);
    writer.seed_system_prompt().unwrap();
    let a = open_node(&network, &rendezvous, &room, Arc::clone(&writer_log)).await;

    // Joiner derives the same room from the printed key
    let joined = RoomIdentity::derive(&key.to_string().parse::<RoomKey>().unwrap());
    assert_eq!(joined.topic, room.topic);
    let replica_log = Arc::new(EntryLog::new(joined.chain_seed));
    let replica: ChatOrchestrator<CannedBackend> = ChatOrchestrator::replica(Arc::clone(&replica_log));
    let b = open_node(&network, &rendezvous, &joined, Arc::clone(&replica_log)).await;

    let mut rendered = replica_log.subscribe(0);
    let first = timeout(Duration::from_secs(10), rendered.next()).await.unwrap();
    assert_eq!(render::render_entry(&first), format!("[system] {SYSTEM_PROMPT}"));

    assert!(matches!(writer.handle_line("hi").await.unwrap(), Turn::Replied { .. }));
    assert!(matches!(writer.handle_line("and again").await.unwrap(), Turn::Replied { .. }));
    assert_eq!(replica.handle_line("can I post?").await.unwrap(), Turn::Refused);

    let mut lines = Vec::new();
    for _ in 0..4 {
        let entry = timeout(Duration::from_secs(10), rendered.next()).await.unwrap();
        lines.push(render::render_entry(&entry));
    }
    assert_eq!(
        lines,
        vec![
            "[user] hi",
            "[assistant] reply #1",
            "[user] and again",
            "[assistant] reply #2",
        ]
    );
    assert_eq!(replica_log.snapshot(), writer_log.snapshot());

    a.close().await.unwrap();
    b.close().await.unwrap();
}
