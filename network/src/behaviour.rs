// SPDX-License-Identifier: MIT OR Apache-2.0

use libp2p::{
    gossipsub, identify, identity::Keypair, kad, mdns,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
    PeerId,
};
use std::time::Duration;

/// Identify protocol string advertised by peerchat nodes
pub const IDENTIFY_PROTOCOL: &str = "/peerchat/1.0.0";

/// Network behaviour used for room discovery
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "Event")]
pub struct DiscoveryBehaviour {
    /// DHT holding provider records per room topic
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,

    /// Signed announcements of replication addresses
    pub gossipsub: gossipsub::Behaviour,

    /// Peer identification (feeds Kademlia routing)
    pub identify: identify::Behaviour,

    /// mDNS for local network discovery
    pub mdns: Toggle<mdns::tokio::Behaviour>,
}

#[derive(Debug)]
pub enum Event {
    Kademlia(kad::Event),
    Gossipsub(gossipsub::Event),
    Identify(identify::Event),
    Mdns(mdns::Event),
}

impl From<kad::Event> for Event {
    fn from(event: kad::Event) -> Self {
        Event::Kademlia(event)
    }
}

impl From<gossipsub::Event> for Event {
    fn from(event: gossipsub::Event) -> Self {
        Event::Gossipsub(event)
    }
}

impl From<identify::Event> for Event {
    fn from(event: identify::Event) -> Self {
        Event::Identify(event)
    }
}

impl From<mdns::Event> for Event {
    fn from(event: mdns::Event) -> Self {
        Event::Mdns(event)
    }
}

impl DiscoveryBehaviour {
    pub fn new(keypair: &Keypair, enable_mdns: bool) -> anyhow::Result<Self> {
        let local_peer_id = PeerId::from(keypair.public());

        let mut kad_config = kad::Config::default();
        kad_config.set_query_timeout(Duration::from_secs(60));
        let store = kad::store::MemoryStore::new(local_peer_id);
        let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
        kademlia.set_mode(Some(kad::Mode::Server));

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(1))
            .validation_mode(gossipsub::ValidationMode::Strict)
            .build()
            .map_err(|e| anyhow::anyhow!("Gossipsub config error: {}", e))?;

        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config,
        )
        .map_err(|e| anyhow::anyhow!("Failed to create gossipsub: {}", e))?;

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            keypair.public(),
        ));

        let mdns = if enable_mdns {
            Some(mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?)
        } else {
            None
        };

        Ok(Self {
            kademlia,
            gossipsub,
            identify,
            mdns: Toggle::from(mdns),
        })
    }
}
