// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common utilities for peerchat integration tests

#![allow(dead_code)]

use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use peerchat_core::{fresh_challenge, Digest, Entry, EntryLog, Role, RoomIdentity, RoomKey};
use peerchat_network::config::{NodeConfig, ReplicationConfig};
use peerchat_network::protocols::replication::{handshake, ReplicationSession};
use peerchat_network::protocols::secure::SessionCipher;
use peerchat_network::protocols::wire::{
    read_frame, read_sealed, write_frame, write_sealed, Message, DEFAULT_MAX_FRAME_LEN, PROTOCOL_VERSION,
};
use peerchat_network::{
    MemoryNetwork, MemoryRendezvous, MemoryTransport, PeerId, RoomNode, SessionError,
    SessionOutcome, SessionState, Transport,
};

/// Upper bound for anything a test waits on
pub const TIMEOUT: Duration = Duration::from_secs(10);

// Initialize logging for tests
static INIT_LOGGING: Lazy<()> = Lazy::new(|| {
    // Only show warnings and errors unless RUST_LOG is explicitly set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
});

pub fn init_logging() {
    Lazy::force(&INIT_LOGGING);
}

pub fn test_room() -> RoomIdentity {
    RoomIdentity::derive(&RoomKey::generate())
}

/// Node config with short retry delays
pub fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.retry.initial_delay = Duration::from_millis(50);
    config.retry.max_delay = Duration::from_millis(500);
    config.shutdown_grace = Duration::from_secs(1);
    config
}

/// Log seeded the way a room creator seeds it
pub fn creator_log(room: &RoomIdentity, turns: &[&str]) -> Arc<EntryLog> {
    let log = Arc::new(EntryLog::new(room.chain_seed));
    log.append(Role::System, "You are a helpful assistant.").unwrap();
    for turn in turns {
        log.append(Role::User, *turn).unwrap();
    }
    log
}

pub async fn wait_for_length(log: &EntryLog, length: u64) {
    if tokio::time::timeout(TIMEOUT, log.wait_for_length(length)).await.is_err() {
        panic!("log stuck at length {} waiting for {}", log.length(), length);
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A test peer on an in-memory network
pub struct TestPeer {
    pub id: PeerId,
    pub log: Arc<EntryLog>,
    pub node: RoomNode<MemoryTransport>,
}

impl TestPeer {
    pub async fn open(
        network: &MemoryNetwork,
        rendezvous: &MemoryRendezvous,
        room: &RoomIdentity,
        id: PeerId,
        log: Arc<EntryLog>,
    ) -> Self {
        init_logging();
        let transport = network.bind();
        let discovery = Arc::new(rendezvous.discovery(id, transport.local_addr()));
        let node = RoomNode::open(id, room.clone(), Arc::clone(&log), transport, discovery, &test_config())
            .await
            .expect("node should open");
        Self { id, log, node }
    }
}

/// Hand-driven end of a replication stream, for poking at a session
pub struct RawPeer {
    pub id: PeerId,
    pub stream: DuplexStream,
    pub cipher: SessionCipher,
}

impl RawPeer {
    /// Run our half of the handshake claiming `length` entries ending in
    /// `last_digest`, and check the node's `Hello` reports `node_length`.
    pub async fn handshake(
        mut stream: DuplexStream,
        room: &RoomIdentity,
        length: u64,
        last_digest: Digest,
        node_length: u64,
    ) -> Self {
        let id = PeerId::random();
        let id_bytes = id.to_bytes();
        let nonce = fresh_challenge();
        let challenge = Message::Challenge {
            version: PROTOCOL_VERSION,
            peer_id: id_bytes.clone(),
            nonce,
        };
        write_frame(&mut stream, &challenge).await.expect("write challenge");
        let node_nonce = match read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await.expect("read challenge") {
            Some(Message::Challenge { nonce, .. }) => nonce,
            other => panic!("expected challenge, got {other:?}"),
        };

        let mut raw = Self {
            id,
            stream,
            cipher: SessionCipher::new(room, &nonce, &node_nonce),
        };
        raw.send(&Message::Hello {
            room_proof: room.membership_proof(&node_nonce, &id_bytes),
            peer_id: id_bytes,
            length,
            last_digest,
        })
        .await;
        match raw.recv().await {
            Some(Message::Hello { length, .. }) => assert_eq!(length, node_length),
            other => panic!("expected hello, got {other:?}"),
        }
        raw
    }

    pub async fn send(&mut self, message: &Message) {
        write_sealed(&mut self.stream, &mut self.cipher.sealer, message)
            .await
            .expect("write frame");
    }

    pub async fn send_entry(&mut self, entry: &Entry) {
        self.send(&Message::from(entry.clone())).await;
    }

    /// Next frame, failing the test if none arrives in time
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(
            TIMEOUT,
            read_sealed(&mut self.stream, &mut self.cipher.opener, DEFAULT_MAX_FRAME_LEN),
        )
        .await
        .expect("timed out waiting for a frame")
        .expect("read frame")
    }

    /// Next frame if one arrives within `wait`
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Message> {
        let frame = read_sealed(&mut self.stream, &mut self.cipher.opener, DEFAULT_MAX_FRAME_LEN);
        match tokio::time::timeout(wait, frame).await {
            Ok(frame) => frame.expect("read frame"),
            Err(_) => None,
        }
    }

    /// Skip credit grants until a frame of another kind arrives
    pub async fn recv_non_request(&mut self) -> Option<Message> {
        loop {
            match self.recv().await {
                Some(Message::Request { .. }) => continue,
                other => return other,
            }
        }
    }
}

pub struct RawSession {
    pub raw: RawPeer,
    pub state: watch::Receiver<SessionState>,
    pub cancel: watch::Sender<bool>,
    pub task: JoinHandle<Result<SessionOutcome, SessionError>>,
}

/// Run a real session over `log` against a `RawPeer` that claims to hold
/// `raw_length` entries ending in `raw_digest`.
pub async fn raw_session(
    room: &RoomIdentity,
    log: Arc<EntryLog>,
    raw_length: u64,
    raw_digest: Digest,
    window: u64,
) -> RawSession {
    init_logging();
    let (mut node_end, raw_end) = tokio::io::duplex(1 << 16);
    let node_id = PeerId::random();
    let config = ReplicationConfig {
        window,
        ..ReplicationConfig::default()
    };

    let (established, raw) = tokio::join!(
        handshake(&mut node_end, &node_id, room, &log, &config),
        RawPeer::handshake(raw_end, room, raw_length, raw_digest, log.length()),
    );
    let established = established.expect("handshake with raw peer");
    assert_eq!(established.remote.peer_id, raw.id);

    let (state_tx, state) = watch::channel(SessionState::Handshaking);
    let (cancel, cancel_rx) = watch::channel(false);
    let session = ReplicationSession::new(node_end, established, log, config, state_tx);
    let task = tokio::spawn(session.run(cancel_rx));

    RawSession {
        raw,
        state,
        cancel,
        task,
    }
}

/// `n` chained entries as a remote writer would produce them
pub fn remote_entries(room: &RoomIdentity, n: u64) -> Vec<Entry> {
    let log = EntryLog::new(room.chain_seed);
    for i in 0..n {
        let role = if i == 0 { Role::System } else { Role::User };
        log.append(role, format!("remote {i}")).unwrap();
    }
    log.snapshot()
}
