// SPDX-License-Identifier: MIT OR Apache-2.0

//! `Discovery` over a libp2p swarm
//!
//! Each joined topic maps to a Kademlia provider key and a gossipsub
//! topic. Announcing processes register as providers and periodically
//! publish their replication addresses; looking-up processes query the
//! providers, dial them, and turn received announcements into
//! `PeerCandidate`s. The swarm runs on its own task and is driven through
//! a command channel.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, TopicHash},
    identify, identity::Keypair,
    kad::{self, GetProvidersOk, QueryResult, RecordKey},
    mdns,
    multiaddr::Protocol,
    noise,
    swarm::SwarmEvent,
    tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use peerchat_core::Topic;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::behaviour::{DiscoveryBehaviour, Event};
use crate::config::DiscoveryConfig;
use crate::protocols::peer_discovery::{
    Discovery, DiscoveryError, JoinOptions, PeerCandidate, CANDIDATE_BUFFER,
};

/// Gossipsub topic name for a room
pub fn gossip_topic(topic: &Topic) -> IdentTopic {
    IdentTopic::new(format!("/peerchat/room/{}", topic))
}

/// Kademlia provider key for a room
pub fn provider_key(topic: &Topic) -> RecordKey {
    RecordKey::new(topic.as_bytes())
}

/// Gossip payload advertising where a peer accepts replication streams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub topic: [u8; 32],
    pub addrs: Vec<SocketAddr>,
}

enum Command {
    Join {
        topic: Topic,
        options: JoinOptions,
        reply: oneshot::Sender<Result<(), DiscoveryError>>,
    },
    Leave {
        topic: Topic,
        reply: oneshot::Sender<Result<(), DiscoveryError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle on a running discovery swarm
pub struct SwarmDiscovery {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    candidates: broadcast::Sender<PeerCandidate>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SwarmDiscovery {
    /// Build the swarm, start listening and bootstrapping, and spawn its task.
    ///
    /// `replication_addr` is the address our replication listener is bound
    /// to; it is what gets announced.
    pub fn spawn(keypair: Keypair, config: &DiscoveryConfig, replication_addr: SocketAddr) -> Result<Self> {
        let local_peer_id = PeerId::from(keypair.public());
        info!("Starting discovery swarm with peer ID: {}", local_peer_id);

        let enable_mdns = config.enable_mdns;
        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key| Ok(DiscoveryBehaviour::new(key, enable_mdns)?))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let listen: Multiaddr = config
            .swarm_listen
            .parse()
            .with_context(|| format!("Invalid swarm listen address: {}", config.swarm_listen))?;
        swarm
            .listen_on(listen)
            .context("Failed to start listening")?;

        let mut bootstrap_peers = Vec::new();
        for node in &config.bootstrap_nodes {
            let addr: Multiaddr = node
                .parse()
                .with_context(|| format!("Invalid bootstrap address: {}", node))?;
            let Some(Protocol::P2p(peer_id)) = addr.iter().last() else {
                anyhow::bail!("Bootstrap address must end in /p2p/<peer id>: {}", node);
            };
            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
            bootstrap_peers.push(addr);
        }

        let (commands, command_rx) = mpsc::channel(32);
        let (candidates, _) = broadcast::channel(CANDIDATE_BUFFER);

        let driver = SwarmDriver {
            swarm,
            local_peer_id,
            replication_addr,
            listen_ips: Vec::new(),
            joined: HashMap::new(),
            topic_hashes: HashMap::new(),
            candidates: candidates.clone(),
            bootstrap_peers,
            bootstrap_backoff: config.bootstrap_backoff,
            min_bootstrap_backoff: config.bootstrap_backoff,
            max_bootstrap_backoff: config.max_bootstrap_backoff,
            announce_interval: config.announce_interval,
        };
        let task = tokio::spawn(driver.run(command_rx));

        Ok(Self {
            local_peer_id,
            commands,
            candidates,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Leave every topic and stop the swarm
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), DiscoveryError>>) -> Command,
    ) -> Result<(), DiscoveryError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| DiscoveryError::Shutdown)?;
        response.await.map_err(|_| DiscoveryError::Shutdown)?
    }
}

impl Discovery for SwarmDiscovery {
    fn join(&self, topic: Topic, options: JoinOptions) -> BoxFuture<'_, Result<(), DiscoveryError>> {
        Box::pin(self.request(move |reply| Command::Join {
            topic,
            options,
            reply,
        }))
    }

    fn leave(&self, topic: Topic) -> BoxFuture<'_, Result<(), DiscoveryError>> {
        Box::pin(self.request(move |reply| Command::Leave { topic, reply }))
    }

    fn candidates(&self) -> broadcast::Receiver<PeerCandidate> {
        self.candidates.subscribe()
    }
}

impl Drop for SwarmDiscovery {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

struct SwarmDriver {
    swarm: Swarm<DiscoveryBehaviour>,
    local_peer_id: PeerId,
    replication_addr: SocketAddr,
    /// IPs the swarm listens on, used when the replication address is unspecified
    listen_ips: Vec<IpAddr>,
    joined: HashMap<Topic, JoinOptions>,
    topic_hashes: HashMap<TopicHash, Topic>,
    candidates: broadcast::Sender<PeerCandidate>,
    bootstrap_peers: Vec<Multiaddr>,
    bootstrap_backoff: Duration,
    min_bootstrap_backoff: Duration,
    max_bootstrap_backoff: Duration,
    announce_interval: Duration,
}

impl SwarmDriver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut announce = interval(self.announce_interval);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let retry = sleep(Duration::ZERO);
        tokio::pin!(retry);
        let mut bootstrap_pending = !self.bootstrap_peers.is_empty();

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    if let Some(delay) = self.handle_swarm_event(event) {
                        retry.as_mut().reset(Instant::now() + delay);
                        bootstrap_pending = true;
                    }
                }

                () = &mut retry, if bootstrap_pending => {
                    bootstrap_pending = false;
                    self.bootstrap();
                }

                _ = announce.tick() => {
                    self.refresh();
                }

                command = commands.recv() => match command {
                    Some(Command::Join { topic, options, reply }) => {
                        let _ = reply.send(self.join(topic, options));
                    }
                    Some(Command::Leave { topic, reply }) => {
                        self.leave(&topic);
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.leave_all();
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.leave_all();
                        break;
                    }
                },
            }
        }
        info!("Discovery swarm stopped");
    }

    fn bootstrap(&mut self) {
        for addr in &self.bootstrap_peers {
            if let Err(e) = self.swarm.dial(addr.clone()) {
                debug!("Failed to dial bootstrap node {}: {}", addr, e);
            }
        }
        if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
            debug!("Kademlia bootstrap not started: {:?}", e);
        }
    }

    fn join(&mut self, topic: Topic, options: JoinOptions) -> Result<(), DiscoveryError> {
        let gossip = gossip_topic(&topic);
        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&gossip)
            .map_err(|e| DiscoveryError::Network(format!("subscribe failed: {e:?}")))?;
        self.topic_hashes.insert(gossip.hash(), topic);

        let key = provider_key(&topic);
        if options.announce {
            self.swarm
                .behaviour_mut()
                .kademlia
                .start_providing(key.clone())
                .map_err(|e| DiscoveryError::Network(format!("start providing failed: {e:?}")))?;
        } else {
            self.swarm.behaviour_mut().kademlia.stop_providing(&key);
        }

        self.joined.insert(topic, options);
        info!(topic = %topic.short(), ?options, "Joined topic");

        if options.announce {
            self.announce(&topic);
        }
        if options.lookup {
            self.swarm.behaviour_mut().kademlia.get_providers(key);
        }
        Ok(())
    }

    fn leave(&mut self, topic: &Topic) {
        if self.joined.remove(topic).is_none() {
            return;
        }
        let gossip = gossip_topic(topic);
        let _ = self.swarm.behaviour_mut().gossipsub.unsubscribe(&gossip);
        self.topic_hashes.remove(&gossip.hash());
        self.swarm
            .behaviour_mut()
            .kademlia
            .stop_providing(&provider_key(topic));
        info!(topic = %topic.short(), "Left topic");
    }

    fn leave_all(&mut self) {
        let topics: Vec<Topic> = self.joined.keys().copied().collect();
        for topic in &topics {
            self.leave(topic);
        }
    }

    /// Periodic announcement and provider lookup for every joined topic
    fn refresh(&mut self) {
        let joined: Vec<(Topic, JoinOptions)> =
            self.joined.iter().map(|(t, o)| (*t, *o)).collect();
        for (topic, options) in joined {
            if options.announce {
                self.announce(&topic);
            }
            if options.lookup {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(provider_key(&topic));
            }
        }
    }

    fn advertised_addrs(&self) -> Vec<SocketAddr> {
        if !self.replication_addr.ip().is_unspecified() {
            return vec![self.replication_addr];
        }
        let port = self.replication_addr.port();
        self.listen_ips
            .iter()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect()
    }

    fn announce(&mut self, topic: &Topic) {
        let addrs = self.advertised_addrs();
        if addrs.is_empty() {
            debug!(topic = %topic.short(), "No listen address yet, skipping announcement");
            return;
        }
        let announcement = Announcement {
            topic: topic.0,
            addrs,
        };
        let data = match serde_cbor::to_vec(&announcement) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode announcement: {}", e);
                return;
            }
        };
        match self
            .swarm
            .behaviour_mut()
            .gossipsub
            .publish(gossip_topic(topic), data)
        {
            Ok(_) => debug!(topic = %topic.short(), "Published announcement"),
            // Expected until a peer subscribes or when nothing changed
            Err(gossipsub::PublishError::InsufficientPeers)
            | Err(gossipsub::PublishError::Duplicate) => {}
            Err(e) => debug!(topic = %topic.short(), "Announcement not published: {:?}", e),
        }
    }

    /// Returns a bootstrap retry delay when a bootstrap attempt failed
    fn handle_swarm_event(&mut self, event: SwarmEvent<Event>) -> Option<Duration> {
        match event {
            SwarmEvent::Behaviour(Event::Kademlia(e)) => return self.handle_kademlia_event(e),
            SwarmEvent::Behaviour(Event::Gossipsub(e)) => self.handle_gossipsub_event(e),
            SwarmEvent::Behaviour(Event::Identify(e)) => self.handle_identify_event(e),
            SwarmEvent::Behaviour(Event::Mdns(e)) => self.handle_mdns_event(e),
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Discovery swarm listening on {}", address);
                if let Some(ip) = ip_of(&address) {
                    if !self.listen_ips.contains(&ip) {
                        self.listen_ips.push(ip);
                    }
                }
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("Connection established with {}", peer_id);
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!("Outgoing connection to {:?} failed: {}", peer_id, error);
            }
            _ => {}
        }
        None
    }

    fn handle_kademlia_event(&mut self, event: kad::Event) -> Option<Duration> {
        if let kad::Event::OutboundQueryProgressed { result, .. } = event {
            match result {
                QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })) => {
                    for provider in providers {
                        if provider == self.local_peer_id {
                            continue;
                        }
                        if !self.swarm.is_connected(&provider) {
                            debug!("Dialing provider {}", provider);
                            if let Err(e) = self.swarm.dial(provider) {
                                debug!("Failed to dial provider {}: {}", provider, e);
                            }
                        }
                    }
                }
                QueryResult::GetProviders(Err(e)) => {
                    debug!("Provider lookup failed: {:?}", e);
                }
                QueryResult::StartProviding(Err(e)) => {
                    debug!("Provider registration failed: {:?}", e);
                }
                QueryResult::Bootstrap(Ok(_)) => {
                    self.bootstrap_backoff = self.min_bootstrap_backoff;
                }
                QueryResult::Bootstrap(Err(e)) => {
                    let delay = self.bootstrap_backoff;
                    warn!("Bootstrap failed: {:?}, retrying in {:?}", e, delay);
                    self.bootstrap_backoff = (self.bootstrap_backoff * 2).min(self.max_bootstrap_backoff);
                    return Some(delay);
                }
                _ => {}
            }
        }
        None
    }

    fn handle_gossipsub_event(&mut self, event: gossipsub::Event) {
        match event {
            gossipsub::Event::Message { message, .. } => {
                let Some(topic) = self.topic_hashes.get(&message.topic).copied() else {
                    return;
                };
                let lookup = self.joined.get(&topic).map_or(false, |o| o.lookup);
                if !lookup || message.source == Some(self.local_peer_id) {
                    return;
                }

                let announcement: Announcement = match serde_cbor::from_slice(&message.data) {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("Failed to decode announcement: {}", e);
                        return;
                    }
                };
                if announcement.topic != topic.0 {
                    warn!(topic = %topic.short(), "Announcement for a different topic, ignoring");
                    return;
                }

                for address in announcement.addrs {
                    let _ = self.candidates.send(PeerCandidate {
                        topic,
                        peer: message.source,
                        address,
                    });
                }
            }
            gossipsub::Event::Subscribed { peer_id, topic } => {
                // Answer a new subscriber straight away instead of waiting for the next tick
                if let Some(room) = self.topic_hashes.get(&topic).copied() {
                    debug!(topic = %room.short(), "Peer {} subscribed", peer_id);
                    if self.joined.get(&room).map_or(false, |o| o.announce) {
                        self.announce(&room);
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_identify_event(&mut self, event: identify::Event) {
        if let identify::Event::Received { peer_id, info, .. } = event {
            debug!("Identified peer {}: {}", peer_id, info.protocol_version);
            for addr in info.listen_addrs {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, addr);
            }
        }
    }

    fn handle_mdns_event(&mut self, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(peers) => {
                for (peer_id, addr) in peers {
                    debug!("Discovered local peer {} at {}", peer_id, addr);
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                    self.swarm
                        .behaviour_mut()
                        .gossipsub
                        .add_explicit_peer(&peer_id);
                }
            }
            mdns::Event::Expired(peers) => {
                for (peer_id, _) in peers {
                    debug!("mDNS peer expired: {}", peer_id);
                }
            }
        }
    }
}

fn ip_of(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}
