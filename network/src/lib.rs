// SPDX-License-Identifier: MIT OR Apache-2.0

//! peerchat network - discovery, connections and log replication
//!
//! This crate provides the networking functionality including:
//! - room discovery over libp2p (Kademlia providers + gossipsub), or in memory
//! - byte-stream transports for replication (TCP, or in memory)
//! - the replication session protocol with catch-up and live tail
//! - a connection manager keeping one session per peer, with backoff
//! - node configuration

#![deny(unsafe_code)]

pub mod behaviour;
pub mod config;
pub mod connection_manager;
pub mod dht_discovery;
pub mod node;
pub mod protocols;
pub mod transport;

pub use config::NodeConfig;
pub use connection_manager::{Direction, PeerStatus, RetryConfig};
pub use dht_discovery::SwarmDiscovery;
pub use node::RoomNode;
pub use protocols::peer_discovery::{
    Discovery, DiscoveryError, JoinOptions, MemoryDiscovery, MemoryRendezvous, PeerCandidate,
};
pub use protocols::replication::{SessionError, SessionOutcome, SessionState};
pub use transport::{MemoryNetwork, MemoryTransport, TcpTransport, Transport};

pub use libp2p::{identity::Keypair, PeerId};
