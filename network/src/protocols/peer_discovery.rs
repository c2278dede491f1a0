// SPDX-License-Identifier: MIT OR Apache-2.0

//! Room discovery
//!
//! A `Discovery` service announces that this process serves a topic and
//! reports other processes serving the same topic as `PeerCandidate`s.
//! Candidates may repeat; consumers deduplicate.

use futures::future::BoxFuture;
use libp2p::PeerId;
use parking_lot::Mutex;
use peerchat_core::Topic;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of candidate broadcast channels
pub const CANDIDATE_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery service has shut down")]
    Shutdown,

    #[error("discovery network error: {0}")]
    Network(String),
}

/// What a `join` should do for the topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Make this process findable
    pub announce: bool,
    /// Look for other processes
    pub lookup: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            announce: true,
            lookup: true,
        }
    }
}

/// A process that claims to serve `topic` at `address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidate {
    pub topic: Topic,
    /// Identity the announcement was signed with, when known
    pub peer: Option<PeerId>,
    /// Replication endpoint
    pub address: SocketAddr,
}

/// Rendezvous service mapping topics to peers
pub trait Discovery: Send + Sync + 'static {
    /// Start announcing and/or looking up `topic`. Idempotent.
    fn join(&self, topic: Topic, options: JoinOptions) -> BoxFuture<'_, Result<(), DiscoveryError>>;

    /// Stop announcing and looking up `topic`
    fn leave(&self, topic: Topic) -> BoxFuture<'_, Result<(), DiscoveryError>>;

    /// Candidates for every joined topic with lookup enabled
    fn candidates(&self) -> broadcast::Receiver<PeerCandidate>;
}

struct Member {
    address: SocketAddr,
    options: JoinOptions,
    candidates: broadcast::Sender<PeerCandidate>,
}

/// In-process rendezvous shared by several `MemoryDiscovery` handles
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    topics: Arc<Mutex<HashMap<Topic, HashMap<PeerId, Member>>>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovery handle for a process reachable at `address`
    pub fn discovery(&self, local_peer: PeerId, address: SocketAddr) -> MemoryDiscovery {
        let (candidates, _) = broadcast::channel(CANDIDATE_BUFFER);
        MemoryDiscovery {
            rendezvous: self.clone(),
            local_peer,
            address,
            candidates,
        }
    }

    /// Number of processes currently joined to `topic`
    pub fn members(&self, topic: &Topic) -> usize {
        self.topics.lock().get(topic).map_or(0, HashMap::len)
    }

    fn join(&self, topic: Topic, peer: PeerId, member: Member) {
        let mut topics = self.topics.lock();
        let members = topics.entry(topic).or_default();

        for (other_id, other) in members.iter() {
            if *other_id == peer {
                continue;
            }
            if member.options.lookup && other.options.announce {
                let _ = member.candidates.send(PeerCandidate {
                    topic,
                    peer: Some(*other_id),
                    address: other.address,
                });
            }
            if member.options.announce && other.options.lookup {
                let _ = other.candidates.send(PeerCandidate {
                    topic,
                    peer: Some(peer),
                    address: member.address,
                });
            }
        }

        debug!(topic = %topic.short(), %peer, "Joined memory rendezvous");
        members.insert(peer, member);
    }

    fn leave(&self, topic: &Topic, peer: &PeerId) {
        let mut topics = self.topics.lock();
        if let Some(members) = topics.get_mut(topic) {
            members.remove(peer);
            if members.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// `Discovery` backed by a `MemoryRendezvous`
pub struct MemoryDiscovery {
    rendezvous: MemoryRendezvous,
    local_peer: PeerId,
    address: SocketAddr,
    candidates: broadcast::Sender<PeerCandidate>,
}

impl Discovery for MemoryDiscovery {
    fn join(&self, topic: Topic, options: JoinOptions) -> BoxFuture<'_, Result<(), DiscoveryError>> {
        let member = Member {
            address: self.address,
            options,
            candidates: self.candidates.clone(),
        };
        self.rendezvous.join(topic, self.local_peer, member);
        Box::pin(async { Ok(()) })
    }

    fn leave(&self, topic: Topic) -> BoxFuture<'_, Result<(), DiscoveryError>> {
        self.rendezvous.leave(&topic, &self.local_peer);
        Box::pin(async { Ok(()) })
    }

    fn candidates(&self) -> broadcast::Receiver<PeerCandidate> {
        self.candidates.subscribe()
    }
}

impl Drop for MemoryDiscovery {
    fn drop(&mut self) {
        let mut topics = self.rendezvous.topics.lock();
        topics.retain(|_, members| {
            members.remove(&self.local_peer);
            !members.is_empty()
        });
    }
}
