// SPDX-License-Identifier: MIT OR Apache-2.0

//! A process's membership in one room

use anyhow::{Context, Result};
use libp2p::PeerId;
use parking_lot::Mutex;
use peerchat_core::{EntryLog, RoomIdentity, Topic};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::NodeConfig;
use crate::connection_manager::{ConnectionManager, PeerStatus};
use crate::protocols::peer_discovery::{Discovery, JoinOptions};
use crate::transport::Transport;

/// Joined room: discovery membership, listener, and replication sessions
pub struct RoomNode<T: Transport> {
    room: RoomIdentity,
    log: Arc<EntryLog>,
    manager: Arc<ConnectionManager<T>>,
    discovery: Arc<dyn Discovery>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> RoomNode<T> {
    /// Start serving `log` for `room` and join the room's topic
    pub async fn open(
        local_id: PeerId,
        room: RoomIdentity,
        log: Arc<EntryLog>,
        transport: T,
        discovery: Arc<dyn Discovery>,
        config: &NodeConfig,
    ) -> Result<Self> {
        let topic = room.topic;
        let local_addr = transport.local_addr();
        let manager = Arc::new(ConnectionManager::new(
            local_id,
            room.clone(),
            Arc::clone(&log),
            Arc::new(transport),
            config.replication.clone(),
            config.retry.clone(),
            config.shutdown_grace,
        ));

        // Subscribe before joining so no candidate is missed
        let candidates = discovery.candidates();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&manager).run(topic, candidates, shutdown_rx));

        if let Err(e) = discovery.join(topic, JoinOptions::default()).await {
            shutdown.send_replace(true);
            let _ = task.await;
            return Err(e).context("Failed to join room topic");
        }

        info!(
            peer = %local_id,
            topic = %topic.short(),
            %local_addr,
            length = log.length(),
            "Room opened"
        );

        Ok(Self {
            room,
            log,
            manager,
            discovery,
            local_addr,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn log(&self) -> &Arc<EntryLog> {
        &self.log
    }

    pub fn topic(&self) -> Topic {
        self.room.topic
    }

    pub fn local_id(&self) -> PeerId {
        self.manager.local_id()
    }

    /// Address other peers dial for replication
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_peers(&self) -> Vec<PeerId> {
        self.manager.active_peers()
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        self.manager.peers()
    }

    /// Leave the topic and close every session
    pub async fn close(&self) -> Result<()> {
        let left = self.discovery.leave(self.room.topic).await;

        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.context("Connection manager task failed")?;
        }

        info!(topic = %self.room.topic.short(), length = self.log.length(), "Room closed");
        left.context("Failed to leave room topic")
    }
}

impl<T: Transport> Drop for RoomNode<T> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
