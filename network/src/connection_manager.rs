// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection management with retry backoff and circuit breakers
//!
//! The manager accepts inbound streams, dials discovery candidates, runs
//! the handshake in both directions and keeps at most one replication
//! session per remote peer. When two connections to the same peer race,
//! the one dialed by the lower `PeerId` survives on both sides.

use libp2p::PeerId;
use parking_lot::Mutex;
use peerchat_core::{EntryLog, RoomIdentity, Topic};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ReplicationConfig;
use crate::protocols::peer_discovery::PeerCandidate;
use crate::protocols::replication::{
    handshake, reject_sealed, Established, ReplicationSession, SessionError, SessionOutcome,
    SessionState,
};
use crate::transport::Transport;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    /// Circuit is closed, connections allowed once the backoff delay passed
    Closed,
    /// Circuit is open, connections blocked
    Open {
        /// When the circuit was opened
        opened_at: Instant,
    },
    /// Circuit is half-open, testing connection
    HalfOpen,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay after the first failure
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Maximum retry delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Exponential backoff factor
    pub backoff_factor: f64,
    /// Circuit breaker threshold
    pub circuit_breaker_threshold: u32,
    /// Circuit breaker timeout
    #[serde(with = "humantime_serde")]
    pub circuit_breaker_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// What a backoff record is kept for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackoffKey {
    /// A known peer identity
    Peer(PeerId),
    /// An address whose identity we have not learned yet
    Addr(SocketAddr),
}

/// Connection state for a peer or address
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Connection attempts
    pub attempts: u32,
    /// Connection established time
    pub connected_at: Option<Instant>,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Earliest time the next attempt may start
    pub retry_at: Option<Instant>,
    /// Circuit breaker state
    pub circuit_breaker: CircuitBreakerState,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            attempts: 0,
            connected_at: None,
            consecutive_failures: 0,
            retry_at: None,
            circuit_breaker: CircuitBreakerState::Closed,
        }
    }
}

/// Per-key exponential backoff with a circuit breaker
pub struct Backoff {
    states: Mutex<HashMap<BackoffKey, ConnectionState>>,
    config: RetryConfig,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Check if a connection attempt is allowed now
    pub fn should_attempt(&self, key: &BackoffKey) -> bool {
        let states = self.states.lock();
        let Some(state) = states.get(key) else {
            return true; // New peer, allow connection
        };
        match state.circuit_breaker {
            CircuitBreakerState::Closed => state.retry_at.map_or(true, |at| Instant::now() >= at),
            CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open { opened_at } => {
                opened_at.elapsed() >= self.config.circuit_breaker_timeout
            }
        }
    }

    pub fn record_attempt(&self, key: &BackoffKey) {
        self.update_state(key, |state| {
            state.attempts += 1;

            // Set to half-open if was open
            if matches!(state.circuit_breaker, CircuitBreakerState::Open { .. }) {
                state.circuit_breaker = CircuitBreakerState::HalfOpen;
            }
        });
    }

    pub fn record_success(&self, key: &BackoffKey) {
        self.update_state(key, |state| {
            state.connected_at = Some(Instant::now());
            state.consecutive_failures = 0;
            state.retry_at = None;
            state.circuit_breaker = CircuitBreakerState::Closed;
        });
    }

    /// Record a failure and return the delay before the next attempt
    pub fn record_failure(&self, key: &BackoffKey) -> Duration {
        let config = &self.config;
        let mut delay = Duration::ZERO;
        self.update_state(key, |state| {
            state.consecutive_failures += 1;
            state.connected_at = None;

            let exponent = state.consecutive_failures.saturating_sub(1).min(32) as i32;
            let secs = config.initial_delay.as_secs_f64() * config.backoff_factor.powi(exponent);
            delay = Duration::from_secs_f64(secs.min(config.max_delay.as_secs_f64()));
            state.retry_at = Some(Instant::now() + delay);

            let half_open = state.circuit_breaker == CircuitBreakerState::HalfOpen;
            if half_open || state.consecutive_failures >= config.circuit_breaker_threshold {
                state.circuit_breaker = CircuitBreakerState::Open {
                    opened_at: Instant::now(),
                };
                error!(
                    "Circuit breaker opened for {:?} after {} consecutive failures",
                    key, state.consecutive_failures
                );
            }
        });
        delay
    }

    /// Get connection state for a key
    pub fn get_state(&self, key: &BackoffKey) -> Option<ConnectionState> {
        self.states.lock().get(key).cloned()
    }

    fn update_state<F>(&self, key: &BackoffKey, updater: F)
    where
        F: FnOnce(&mut ConnectionState),
    {
        let mut states = self.states.lock();
        updater(states.entry(*key).or_default());
    }
}

/// Which side opened a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Snapshot of one live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub direction: Direction,
    pub state: SessionState,
    /// Outbound dials made to this peer so far
    pub attempts: u32,
    /// When the current session was admitted
    pub connected_at: Option<Instant>,
}

struct ActiveSession {
    conn_id: u64,
    direction: Direction,
    cancel: watch::Sender<bool>,
    state: watch::Receiver<SessionState>,
}

/// Owns the replication sessions of one room
pub struct ConnectionManager<T: Transport> {
    local_id: PeerId,
    room: RoomIdentity,
    log: Arc<EntryLog>,
    transport: Arc<T>,
    replication: ReplicationConfig,
    shutdown_grace: Duration,
    backoff: Backoff,
    sessions: Mutex<HashMap<PeerId, ActiveSession>>,
    dialing: Mutex<HashSet<BackoffKey>>,
    next_conn_id: AtomicU64,
    closing: AtomicBool,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        local_id: PeerId,
        room: RoomIdentity,
        log: Arc<EntryLog>,
        transport: Arc<T>,
        replication: ReplicationConfig,
        retry: RetryConfig,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            local_id,
            room,
            log,
            transport,
            replication,
            shutdown_grace,
            backoff: Backoff::new(retry),
            sessions: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            next_conn_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Peers with a live session
    pub fn active_peers(&self) -> Vec<PeerId> {
        self.sessions.lock().keys().copied().collect()
    }

    /// Direction, session state and connection history of every live session
    pub fn peers(&self) -> Vec<PeerStatus> {
        self.sessions
            .lock()
            .iter()
            .map(|(peer_id, s)| {
                let history = self.backoff.get_state(&BackoffKey::Peer(*peer_id)).unwrap_or_default();
                PeerStatus {
                    peer_id: *peer_id,
                    direction: s.direction,
                    state: *s.state.borrow(),
                    attempts: history.attempts,
                    connected_at: history.connected_at,
                }
            })
            .collect()
    }

    /// Accept inbound streams and dial candidates for `topic` until
    /// `shutdown` flips to true, then close every session.
    pub async fn run(
        self: Arc<Self>,
        topic: Topic,
        mut candidates: broadcast::Receiver<PeerCandidate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tasks = JoinSet::new();
        let mut candidates_open = true;

        info!(
            peer = %self.local_id,
            topic = %topic.short(),
            addr = %self.transport.local_addr(),
            "Connection manager started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                accepted = self.transport.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "Inbound connection");
                        tasks.spawn(Arc::clone(&self).handle_inbound(stream, addr));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },

                candidate = candidates.recv(), if candidates_open => match candidate {
                    Ok(candidate) if candidate.topic == topic => {
                        self.consider(candidate, &mut tasks);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Candidate stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Candidate stream closed");
                        candidates_open = false;
                    }
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                }
            }
        }

        self.shutdown_sessions(tasks).await;
    }

    async fn shutdown_sessions(&self, mut tasks: JoinSet<()>) {
        self.closing.store(true, Ordering::SeqCst);
        let count = {
            let sessions = self.sessions.lock();
            for session in sessions.values() {
                session.cancel.send_replace(true);
            }
            sessions.len()
        };
        info!(sessions = count, "Closing sessions");

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Sessions did not close within {:?}, aborting", self.shutdown_grace);
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        self.sessions.lock().clear();
    }

    fn consider(self: &Arc<Self>, candidate: PeerCandidate, tasks: &mut JoinSet<()>) {
        if candidate.peer == Some(self.local_id) || candidate.address == self.transport.local_addr() {
            return;
        }
        if let Some(peer) = candidate.peer {
            if self.sessions.lock().contains_key(&peer) {
                return;
            }
        }

        let key = candidate
            .peer
            .map(BackoffKey::Peer)
            .unwrap_or(BackoffKey::Addr(candidate.address));
        if !self.backoff.should_attempt(&key) {
            debug!(?key, "Skipping candidate in backoff");
            return;
        }
        if !self.dialing.lock().insert(key) {
            return;
        }

        self.backoff.record_attempt(&key);
        tasks.spawn(Arc::clone(self).handle_outbound(candidate, key));
    }

    async fn handle_outbound(self: Arc<Self>, candidate: PeerCandidate, key: BackoffKey) {
        let connected = self.connect(&candidate).await;
        self.dialing.lock().remove(&key);

        match connected {
            Ok((stream, established)) => {
                self.backoff.record_success(&key);
                self.run_session(stream, established, Direction::Outbound).await;
            }
            Err(SessionError::Rejected(reason)) => {
                debug!(addr = %candidate.address, %reason, "Dial rejected by peer");
            }
            Err(SessionError::SelfConnection) => {
                debug!(addr = %candidate.address, "Candidate is ourselves");
            }
            Err(e) => {
                let delay = self.backoff.record_failure(&key);
                info!(
                    addr = %candidate.address,
                    error = %e,
                    retry_in = ?delay,
                    "Failed to connect to candidate"
                );
            }
        }
    }

    async fn connect(&self, candidate: &PeerCandidate) -> Result<(T::Stream, Established), SessionError> {
        let mut stream = self.transport.dial(candidate.address).await?;
        let mut established =
            handshake(&mut stream, &self.local_id, &self.room, &self.log, &self.replication).await?;

        if let Some(expected) = candidate.peer {
            let actual = established.remote.peer_id;
            if expected != actual {
                reject_sealed(&mut stream, &mut established.cipher.sealer, "unexpected identity").await;
                return Err(SessionError::Protocol(format!(
                    "announced {} but handshake was from {}",
                    expected, actual
                )));
            }
        }
        Ok((stream, established))
    }

    async fn handle_inbound(self: Arc<Self>, mut stream: T::Stream, addr: SocketAddr) {
        match handshake(&mut stream, &self.local_id, &self.room, &self.log, &self.replication).await {
            Ok(established) => self.run_session(stream, established, Direction::Inbound).await,
            Err(e) => debug!(%addr, error = %e, "Inbound handshake failed"),
        }
    }

    /// Lower `PeerId` dials the connection both sides keep
    fn preferred(&self, remote: &PeerId, direction: Direction) -> bool {
        let dialer = match direction {
            Direction::Outbound => self.local_id,
            Direction::Inbound => *remote,
        };
        let listener = if dialer == self.local_id { *remote } else { self.local_id };
        dialer < listener
    }

    async fn run_session(&self, mut stream: T::Stream, mut established: Established, direction: Direction) {
        let peer = established.remote.peer_id;
        if self.closing.load(Ordering::SeqCst) {
            reject_sealed(&mut stream, &mut established.cipher.sealer, "shutting down").await;
            return;
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Handshaking);

        let admitted = {
            let mut sessions = self.sessions.lock();
            let replace = match sessions.get(&peer) {
                None => true,
                Some(existing) => {
                    self.preferred(&peer, direction) && !self.preferred(&peer, existing.direction)
                }
            };
            if replace {
                let previous = sessions.insert(
                    peer,
                    ActiveSession {
                        conn_id,
                        direction,
                        cancel: cancel_tx,
                        state: state_rx,
                    },
                );
                if let Some(previous) = previous {
                    debug!(%peer, "Replacing connection dialed by the higher peer id");
                    previous.cancel.send_replace(true);
                }
            }
            replace
        };

        if !admitted {
            debug!(%peer, ?direction, "Closing duplicate connection");
            reject_sealed(&mut stream, &mut established.cipher.sealer, "duplicate connection").await;
            return;
        }

        self.backoff.record_success(&BackoffKey::Peer(peer));
        info!(%peer, ?direction, remote_length = established.remote.length, "Session established");
        let session = ReplicationSession::new(
            stream,
            established,
            Arc::clone(&self.log),
            self.replication.clone(),
            state_tx,
        );
        let result = session.run(cancel_rx).await;

        {
            let mut sessions = self.sessions.lock();
            if sessions.get(&peer).map_or(false, |s| s.conn_id == conn_id) {
                sessions.remove(&peer);
            }
        }

        match result {
            Ok(SessionOutcome::Cancelled) => debug!(%peer, "Session cancelled"),
            Ok(outcome) => info!(%peer, ?outcome, "Session closed"),
            Err(e) => {
                let delay = self.backoff.record_failure(&BackoffKey::Peer(peer));
                warn!(%peer, error = %e, retry_in = ?delay, "Session closed with error");
            }
        }
    }
}
