// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quick peerchat demo - two peers in one process
//!
//! Peer A creates a room and writes a few turns; peer B joins with the same
//! key over loopback TCP, catches up, and follows A's new entries live.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use peerchat_core::{EntryLog, Role, RoomIdentity, RoomKey};
use peerchat_network::config::NodeConfig;
use peerchat_network::{MemoryRendezvous, PeerId, RoomNode, TcpTransport, Transport};

async fn open_peer(
    name: &str,
    rendezvous: &MemoryRendezvous,
    room: &RoomIdentity,
    log: Arc<EntryLog>,
) -> Result<RoomNode<TcpTransport>> {
    let transport = TcpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let id = PeerId::random();
    let discovery = Arc::new(rendezvous.discovery(id, transport.local_addr()));
    let node = RoomNode::open(id, room.clone(), log, transport, discovery, &NodeConfig::default()).await?;
    println!("{name}: peer {} listening on {}", id, node.local_addr());
    Ok(node)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let key = RoomKey::generate();
    let room = RoomIdentity::derive(&key);
    println!("Room key: {key}");
    println!("Room topic: {}", room.topic);

    let rendezvous = MemoryRendezvous::new();

    let a_log = Arc::new(EntryLog::new(room.chain_seed));
    a_log.append(Role::System, "You are a helpful assistant.")?;
    a_log.append(Role::User, "hi")?;
    let a = open_peer("A", &rendezvous, &room, Arc::clone(&a_log)).await?;

    let b_log = Arc::new(EntryLog::new(room.chain_seed));
    let mut b_view = b_log.subscribe(0);
    let b = open_peer("B", &rendezvous, &room, Arc::clone(&b_log)).await?;

    let printer = tokio::spawn(async move {
        for _ in 0..4 {
            let entry = b_view.next().await;
            println!("B received #{} {} [{}] {}", entry.sequence, entry.short_digest(), entry.role, entry.content);
        }
    });

    tokio::time::timeout(Duration::from_secs(10), b_log.wait_for_length(2))
        .await
        .context("B did not catch up")?;
    println!("B caught up to length {}", b_log.length());

    a_log.append(Role::Assistant, "hello")?;
    a_log.append(Role::User, "how is everyone?")?;

    tokio::time::timeout(Duration::from_secs(10), printer)
        .await
        .context("B did not receive the live entries")??;
    println!(
        "Logs identical: {} (head {})",
        a_log.snapshot() == b_log.snapshot(),
        head_digest(&b_log)
    );

    a.close().await?;
    b.close().await?;
    Ok(())
}

fn head_digest(log: &EntryLog) -> String {
    log.snapshot()
        .last()
        .map(|e| e.short_digest())
        .unwrap_or_else(|| "-".to_string())
}
