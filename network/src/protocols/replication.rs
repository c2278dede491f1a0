// SPDX-License-Identifier: MIT OR Apache-2.0

//! Log replication between two peers over one duplex stream
//!
//! After the handshake every frame is sealed with the session cipher. Each
//! side grants the other credit with
//! `Request{from, to}` and streams entries inside the credit it was
//! granted. The shorter side catches up while `Syncing`, then both sides
//! forward new entries from their local subscription while `Tailing`.

use libp2p::PeerId;
use peerchat_core::{
    fresh_challenge, Applied, Challenge, Digest, Entry, EntryLog, LogError, RoomIdentity, Subscription,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn, Instrument};

use super::secure::{FrameOpener, FrameSealer, SessionCipher};
use super::wire::{
    decode, read_body, read_frame, read_sealed, write_frame, write_sealed, Message, WireError,
    PROTOCOL_VERSION,
};
use crate::config::ReplicationConfig;

/// Upper bound on best-effort writes during teardown
const BYE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("entry {sequence} failed verification")]
    Verification { sequence: u64 },

    #[error("logs diverged at sequence {sequence}")]
    Diverged { sequence: u64 },

    #[error("peer is not a member of this room")]
    RoomMismatch,

    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u16, theirs: u16 },

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connected to ourselves")]
    SelfConnection,

    #[error("peer rejected the session: {0}")]
    Rejected(String),

    #[error("local log error: {0}")]
    Log(#[from] LogError),
}

/// Lifecycle of a replication session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Syncing,
    Tailing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Syncing => "syncing",
            SessionState::Tailing => "tailing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// How a session ended without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    PeerDisconnected,
    PeerSaidBye(String),
    Cancelled,
}

/// What the remote told us in its `Hello`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHello {
    pub peer_id: PeerId,
    pub version: u16,
    pub length: u64,
    pub last_digest: Digest,
}

/// A verified remote and the cipher for the rest of the session
pub struct Established {
    pub remote: RemoteHello,
    pub cipher: SessionCipher,
}

/// Run the handshake and validate the remote.
///
/// Both sides send a `Challenge` in the clear, derive the session cipher
/// from the two nonces, then exchange sealed `Hello`s whose proof answers
/// the other side's nonce. A `Hello` recorded from another session neither
/// opens under the new keys nor answers the new nonce.
///
/// On failure a `Bye` carrying the reason is sent before returning, sealed
/// once the cipher exists.
pub async fn handshake<S>(
    stream: &mut S,
    local_id: &PeerId,
    room: &RoomIdentity,
    log: &EntryLog,
    config: &ReplicationConfig,
) -> Result<Established, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local_nonce = fresh_challenge();
    let mut cipher = None;

    let result = match timeout(
        config.handshake_timeout,
        exchange(stream, &local_nonce, &mut cipher, local_id, room, log, config),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(SessionError::HandshakeTimeout),
    };

    match (result, cipher) {
        (Ok(remote), Some(cipher)) => {
            debug!(
                peer = %remote.peer_id,
                remote_length = remote.length,
                local_length = log.length(),
                "Handshake complete"
            );
            Ok(Established { remote, cipher })
        }
        (Ok(_), None) => Err(SessionError::Protocol("handshake ended without a cipher".to_string())),
        (Err(SessionError::Rejected(reason)), _) => Err(SessionError::Rejected(reason)),
        (Err(e), Some(mut cipher)) => {
            reject_sealed(stream, &mut cipher.sealer, &e.to_string()).await;
            Err(e)
        }
        (Err(e), None) => {
            reject(stream, &e.to_string()).await;
            Err(e)
        }
    }
}

async fn exchange<S>(
    stream: &mut S,
    local_nonce: &Challenge,
    cipher: &mut Option<SessionCipher>,
    local_id: &PeerId,
    room: &RoomIdentity,
    log: &EntryLog,
    config: &ReplicationConfig,
) -> Result<RemoteHello, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id_bytes = local_id.to_bytes();
    let challenge = Message::Challenge {
        version: PROTOCOL_VERSION,
        peer_id: id_bytes.clone(),
        nonce: *local_nonce,
    };
    write_frame(stream, &challenge).await?;

    let (version, peer_bytes, remote_nonce) = match read_frame(stream, config.max_frame_len).await? {
        Some(Message::Challenge {
            version,
            peer_id,
            nonce,
        }) => (version, peer_id, nonce),
        other => return Err(unexpected(other, "challenge")),
    };
    if version != PROTOCOL_VERSION {
        return Err(SessionError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: version,
        });
    }
    let peer_id = PeerId::from_bytes(&peer_bytes)
        .map_err(|e| SessionError::Protocol(format!("invalid peer id: {e}")))?;
    if peer_id == *local_id {
        return Err(SessionError::SelfConnection);
    }
    if remote_nonce == *local_nonce {
        return Err(SessionError::Protocol("challenge was reflected".to_string()));
    }

    let keys = cipher.insert(SessionCipher::new(room, local_nonce, &remote_nonce));
    let (length, last_digest) = log.head();
    let hello = Message::Hello {
        room_proof: room.membership_proof(&remote_nonce, &id_bytes),
        peer_id: id_bytes,
        length,
        last_digest,
    };
    write_sealed(stream, &mut keys.sealer, &hello).await?;

    let body = read_body(stream, config.max_frame_len)
        .await?
        .ok_or_else(|| unexpected(None, "hello"))?;
    let message = match keys.opener.open(&body) {
        Ok(message) => message,
        // A peer that failed before deriving keys says bye in the clear.
        Err(WireError::Unauthenticated) => {
            return Err(match decode(&body) {
                Ok(Message::Bye { reason }) => SessionError::Rejected(reason),
                _ => SessionError::RoomMismatch,
            })
        }
        Err(e) => return Err(e.into()),
    };

    let (hello_peer, room_proof, length, last_digest) = match message {
        Message::Hello {
            peer_id,
            room_proof,
            length,
            last_digest,
        } => (peer_id, room_proof, length, last_digest),
        other => return Err(unexpected(Some(other), "hello")),
    };
    if hello_peer != peer_bytes || !room.check_membership(local_nonce, &peer_bytes, &room_proof) {
        return Err(SessionError::RoomMismatch);
    }

    // The longer side checks that the shorter side's head is on its chain.
    if let Some(ours) = log.digest_at_length(length) {
        if ours != last_digest {
            return Err(SessionError::Diverged {
                sequence: length.saturating_sub(1),
            });
        }
    }

    Ok(RemoteHello {
        peer_id,
        version,
        length,
        last_digest,
    })
}

fn unexpected(frame: Option<Message>, expected: &str) -> SessionError {
    match frame {
        Some(Message::Bye { reason }) => SessionError::Rejected(reason),
        Some(other) => SessionError::Protocol(format!("expected {expected}, got {}", other.kind())),
        None => SessionError::Protocol("connection closed during handshake".to_string()),
    }
}

/// Send `Bye{reason}` in the clear and shut the stream down, ignoring failures
pub async fn reject<S>(stream: &mut S, reason: &str)
where
    S: AsyncWrite + Unpin,
{
    let bye = Message::bye(reason);
    let _ = timeout(BYE_TIMEOUT, async {
        write_frame(stream, &bye).await?;
        stream.shutdown().await?;
        Ok::<_, WireError>(())
    })
    .await;
}

/// Send a sealed `Bye{reason}` and shut the stream down, ignoring failures
pub async fn reject_sealed<S>(stream: &mut S, sealer: &mut FrameSealer, reason: &str)
where
    S: AsyncWrite + Unpin,
{
    let bye = Message::bye(reason);
    let _ = timeout(BYE_TIMEOUT, async {
        write_sealed(stream, sealer, &bye).await?;
        stream.shutdown().await?;
        Ok::<_, WireError>(())
    })
    .await;
}

/// Replication with one remote peer after a successful handshake
pub struct ReplicationSession<S> {
    stream: S,
    remote: RemoteHello,
    cipher: SessionCipher,
    log: Arc<EntryLog>,
    config: ReplicationConfig,
    state: watch::Sender<SessionState>,
}

impl<S> ReplicationSession<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        stream: S,
        established: Established,
        log: Arc<EntryLog>,
        config: ReplicationConfig,
        state: watch::Sender<SessionState>,
    ) -> Self {
        Self {
            stream,
            remote: established.remote,
            cipher: established.cipher,
            log,
            config,
            state,
        }
    }

    /// Run until the peer goes away, says `Bye`, `cancel` flips to true, or
    /// a protocol error occurs. The state is `Closed` on return.
    pub async fn run(self, cancel: watch::Receiver<bool>) -> Result<SessionOutcome, SessionError> {
        let span = tracing::info_span!("session", peer = %self.remote.peer_id);
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(self, mut cancel: watch::Receiver<bool>) -> Result<SessionOutcome, SessionError> {
        let Self {
            stream,
            remote,
            cipher,
            log,
            config,
            state,
        } = self;

        let (read_half, write_half) = tokio::io::split(stream);
        let (sealer, opener) = cipher.split();
        // Room for a full window of entries plus credit messages, so the
        // reader never stalls behind our own writes.
        let capacity = (config.window as usize).saturating_mul(2).saturating_add(16);
        let (frame_tx, mut frames) = mpsc::channel(capacity);
        let reader = tokio::spawn(
            read_frames(read_half, opener, frame_tx, config.max_frame_len).in_current_span(),
        );

        let mut driver = Driver {
            outgoing: log.subscribe(remote.length),
            peer_has: remote.length,
            peer_credit: 0,
            granted: 0,
            pending: BTreeMap::new(),
            window: config.window.max(1),
            writer: write_half,
            sealer,
            remote,
            log,
            state,
        };

        let result = driver.drive(&mut frames, &mut cancel).await;

        match &result {
            Ok(SessionOutcome::Cancelled) => {
                info!("Session cancelled");
                reject_sealed(&mut driver.writer, &mut driver.sealer, "shutting down").await;
            }
            Ok(outcome) => {
                info!(?outcome, length = driver.log.length(), "Session ended");
                let _ = timeout(BYE_TIMEOUT, driver.writer.shutdown()).await;
            }
            Err(e) => {
                warn!(error = %e, "Session failed");
                reject_sealed(&mut driver.writer, &mut driver.sealer, &e.to_string()).await;
            }
        }

        reader.abort();
        driver.state.send_replace(SessionState::Closed);
        result
    }
}

async fn read_frames<S>(
    mut reader: ReadHalf<S>,
    mut opener: FrameOpener,
    frames: mpsc::Sender<Result<Option<Message>, WireError>>,
    max_frame_len: usize,
) where
    S: AsyncRead,
{
    loop {
        let frame = read_sealed(&mut reader, &mut opener, max_frame_len).await;
        let last = !matches!(frame, Ok(Some(_)));
        if frames.send(frame).await.is_err() || last {
            break;
        }
    }
}

struct Driver<S> {
    writer: WriteHalf<S>,
    sealer: FrameSealer,
    remote: RemoteHello,
    log: Arc<EntryLog>,
    state: watch::Sender<SessionState>,
    /// Local entries to forward, positioned at the next one the peer may need
    outgoing: Subscription,
    /// Everything below this is known to be held by the peer
    peer_has: u64,
    /// Exclusive upper bound the peer allowed us to send to
    peer_credit: u64,
    /// Exclusive upper bound we allowed the peer to send to
    granted: u64,
    /// Entries received ahead of a gap
    pending: BTreeMap<u64, Entry>,
    window: u64,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn drive(
        &mut self,
        frames: &mut mpsc::Receiver<Result<Option<Message>, WireError>>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<SessionOutcome, SessionError> {
        let initial = if self.log.length() < self.remote.length {
            SessionState::Syncing
        } else {
            SessionState::Tailing
        };
        self.state.send_replace(initial);
        info!(
            state = %initial,
            local_length = self.log.length(),
            remote_length = self.remote.length,
            "Replication started"
        );

        if *cancel.borrow() {
            return Ok(SessionOutcome::Cancelled);
        }

        loop {
            self.drain_pending().await?;
            self.grant_credit().await?;

            let can_send = self.outgoing.position() < self.peer_credit;
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Ok(SessionOutcome::Cancelled);
                    }
                }
                frame = frames.recv() => match frame {
                    None | Some(Ok(None)) => return Ok(SessionOutcome::PeerDisconnected),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Some(message))) => {
                        if let Some(outcome) = self.handle_message(message).await? {
                            return Ok(outcome);
                        }
                    }
                },
                entry = self.outgoing.next(), if can_send => {
                    self.forward(entry).await?;
                }
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<Option<SessionOutcome>, SessionError> {
        let kind = message.kind();
        match message {
            Message::Request { from, to } => {
                if from > to {
                    return Err(SessionError::Protocol(format!(
                        "request range {from}..{to} is inverted"
                    )));
                }
                trace!(from, to, "Credit granted by peer");
                self.peer_credit = self.peer_credit.max(to);
                self.mark_peer_has(from);
            }
            Message::EntryData {
                sequence,
                role,
                content,
                digest,
            } => {
                self.receive(Entry {
                    sequence,
                    role,
                    content,
                    digest,
                })
                .await?;
            }
            Message::Bye { reason } => {
                info!(%reason, "Peer said bye");
                return Ok(Some(SessionOutcome::PeerSaidBye(reason)));
            }
            Message::Challenge { .. } | Message::Hello { .. } => {
                return Err(SessionError::Protocol(format!("unexpected {kind}")));
            }
        }
        Ok(None)
    }

    async fn receive(&mut self, entry: Entry) -> Result<(), SessionError> {
        let sequence = entry.sequence;
        if sequence >= self.granted {
            return Err(SessionError::Protocol(format!(
                "entry {sequence} is beyond granted credit {}",
                self.granted
            )));
        }

        let length = self.log.length();
        if sequence > length {
            if self.pending.len() as u64 >= self.window {
                return Err(SessionError::Protocol("reorder buffer overflow".to_string()));
            }
            trace!(sequence, length, "Buffering out-of-order entry");
            self.pending.insert(sequence, entry);
            return Ok(());
        }

        self.apply(entry).await
    }

    async fn drain_pending(&mut self) -> Result<(), SessionError> {
        while let Some((&sequence, _)) = self.pending.first_key_value() {
            if sequence > self.log.length() {
                break;
            }
            if let Some(entry) = self.pending.remove(&sequence) {
                self.apply(entry).await?;
            }
        }
        Ok(())
    }

    async fn apply(&mut self, entry: Entry) -> Result<(), SessionError> {
        let sequence = entry.sequence;
        match self.log.apply_async(entry).await {
            Ok(Applied::Applied) => debug!(sequence, "Applied entry"),
            Ok(Applied::Duplicate) => trace!(sequence, "Duplicate entry"),
            Err(LogError::VerificationFailed { sequence }) => {
                warn!(peer = %self.remote.peer_id, sequence, "Entry failed verification");
                return Err(SessionError::Verification { sequence });
            }
            Err(LogError::Diverged { sequence }) => {
                warn!(peer = %self.remote.peer_id, sequence, "Entry diverges from local log");
                return Err(SessionError::Diverged { sequence });
            }
            Err(LogError::OutOfOrder { sequence, expected }) => {
                return Err(SessionError::Protocol(format!(
                    "entry {sequence} applied out of order, expected {expected}"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        self.mark_peer_has(sequence + 1);
        if *self.state.borrow() == SessionState::Syncing && self.log.length() >= self.remote.length {
            info!(length = self.log.length(), "Caught up with peer");
            self.state.send_replace(SessionState::Tailing);
        }
        Ok(())
    }

    fn mark_peer_has(&mut self, sequence: u64) {
        self.peer_has = self.peer_has.max(sequence);
        self.outgoing.skip_to(self.peer_has);
    }

    /// Top the peer's credit back up once half of it is used
    async fn grant_credit(&mut self) -> Result<(), SessionError> {
        let length = self.log.length();
        if self.granted.saturating_sub(length) > self.window / 2 {
            return Ok(());
        }
        let to = length + self.window;
        write_sealed(&mut self.writer, &mut self.sealer, &Message::Request { from: length, to }).await?;
        trace!(from = length, to, "Granted credit");
        self.granted = to;
        Ok(())
    }

    async fn forward(&mut self, entry: Entry) -> Result<(), SessionError> {
        if entry.sequence < self.peer_has {
            return Ok(());
        }
        trace!(sequence = entry.sequence, "Sending entry");
        write_sealed(&mut self.writer, &mut self.sealer, &Message::from(entry)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::wire::{encode, write_body, DEFAULT_MAX_FRAME_LEN};
    use peerchat_core::{RoomKey, Role};
    use tokio::io::duplex;

    fn room() -> RoomIdentity {
        RoomIdentity::derive(&"00112233445566778899aabbccddeeff".parse::<RoomKey>().unwrap())
    }

    fn log_with(room: &RoomIdentity, n: u64) -> Arc<EntryLog> {
        let log = Arc::new(EntryLog::new(room.chain_seed));
        for i in 0..n {
            log.append(Role::User, format!("entry {i}")).unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_handshake_exchanges_lengths() {
        let room = room();
        let config = ReplicationConfig::default();
        let (a_id, b_id) = (PeerId::random(), PeerId::random());
        let (a_log, b_log) = (log_with(&room, 3), log_with(&room, 1));
        let (mut a, mut b) = duplex(4096);

        let (ra, rb) = tokio::join!(
            handshake(&mut a, &a_id, &room, &a_log, &config),
            handshake(&mut b, &b_id, &room, &b_log, &config),
        );
        let (mut ra, mut rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.remote.peer_id, b_id);
        assert_eq!(ra.remote.length, 1);
        assert_eq!(rb.remote.peer_id, a_id);
        assert_eq!(rb.remote.length, 3);

        // Both sides derived matching ciphers
        let body = encode(&Message::Request { from: 1, to: 65 }).unwrap();
        let sealed = ra.cipher.sealer.seal(&body).unwrap();
        assert_eq!(rb.cipher.opener.open(&sealed).unwrap(), Message::Request { from: 1, to: 65 });
        let sealed = rb.cipher.sealer.seal(&body).unwrap();
        assert!(ra.cipher.opener.open(&sealed).is_ok());
    }

    #[tokio::test]
    async fn test_replayed_hello_is_rejected() {
        let room = room();
        let config = ReplicationConfig::default();
        let writer_log = log_with(&room, 2);

        // Record what an honest member sends during a handshake
        let (mut member_end, mut tap) = duplex(1 << 16);
        let member = tokio::spawn({
            let (room, config) = (room.clone(), config.clone());
            let member_log = log_with(&room, 0);
            async move {
                let _ = handshake(&mut member_end, &PeerId::random(), &room, &member_log, &config).await;
            }
        });
        let recorded_challenge = read_frame(&mut tap, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();
        let answer = Message::Challenge {
            version: PROTOCOL_VERSION,
            peer_id: PeerId::random().to_bytes(),
            nonce: fresh_challenge(),
        };
        write_frame(&mut tap, &answer).await.unwrap();
        let recorded_hello = read_body(&mut tap, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();
        member.abort();

        // Replay both frames to the writer without the room key
        let (mut writer_end, mut replayer) = duplex(1 << 16);
        let writer = tokio::spawn(async move {
            handshake(&mut writer_end, &PeerId::random(), &room, &writer_log, &config)
                .await
                .map(|established| established.remote)
        });
        write_frame(&mut replayer, &recorded_challenge).await.unwrap();
        assert!(matches!(
            read_frame(&mut replayer, DEFAULT_MAX_FRAME_LEN).await.unwrap(),
            Some(Message::Challenge { .. })
        ));
        write_body(&mut replayer, &recorded_hello).await.unwrap();

        let result = writer.await.unwrap();
        assert!(matches!(result, Err(SessionError::RoomMismatch)));

        // Nothing after the challenge decodes without the session keys
        while let Some(body) = read_body(&mut replayer, DEFAULT_MAX_FRAME_LEN).await.unwrap() {
            assert!(decode(&body).is_err());
        }
    }

    #[tokio::test]
    async fn test_hello_answering_a_stale_challenge_is_rejected() {
        let room = room();
        let config = ReplicationConfig::default();
        let log = log_with(&room, 1);
        let (mut node_end, mut raw) = duplex(1 << 16);
        let node = tokio::spawn(async move {
            handshake(&mut node_end, &PeerId::random(), &room, &log, &config)
                .await
                .map(|established| established.remote)
        });

        // A key holder answering some other nonce still fails the check
        let room = self::room();
        let raw_id = PeerId::random().to_bytes();
        let raw_nonce = fresh_challenge();
        let challenge = Message::Challenge {
            version: PROTOCOL_VERSION,
            peer_id: raw_id.clone(),
            nonce: raw_nonce,
        };
        write_frame(&mut raw, &challenge).await.unwrap();
        let node_nonce = match read_frame(&mut raw, DEFAULT_MAX_FRAME_LEN).await.unwrap() {
            Some(Message::Challenge { nonce, .. }) => nonce,
            other => panic!("expected challenge, got {other:?}"),
        };
        let mut cipher = SessionCipher::new(&room, &raw_nonce, &node_nonce);
        let hello = Message::Hello {
            room_proof: room.membership_proof(&fresh_challenge(), &raw_id),
            peer_id: raw_id,
            length: 0,
            last_digest: room.chain_seed,
        };
        write_sealed(&mut raw, &mut cipher.sealer, &hello).await.unwrap();

        assert!(matches!(node.await.unwrap(), Err(SessionError::RoomMismatch)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_room() {
        let room_a = room();
        let room_b = RoomIdentity::derive(&RoomKey::generate());
        let config = ReplicationConfig::default();
        let (a_log, b_log) = (log_with(&room_a, 0), log_with(&room_b, 0));
        let (mut a, mut b) = duplex(4096);

        let (id_a, id_b) = (PeerId::random(), PeerId::random());
        let (ra, rb) = tokio::join!(
            handshake(&mut a, &id_a, &room_a, &a_log, &config),
            handshake(&mut b, &id_b, &room_b, &b_log, &config),
        );
        assert!(matches!(ra, Err(SessionError::RoomMismatch)));
        assert!(matches!(rb, Err(SessionError::RoomMismatch)));
    }

    #[tokio::test]
    async fn test_handshake_detects_divergence() {
        let room = room();
        let config = ReplicationConfig::default();
        let a_log = log_with(&room, 3);
        let b_log = Arc::new(EntryLog::new(room.chain_seed));
        b_log.append(Role::User, "entry 0").unwrap();
        b_log.append(Role::User, "a different entry").unwrap();
        let (mut a, mut b) = duplex(4096);

        let (id_a, id_b) = (PeerId::random(), PeerId::random());
        let (ra, _rb) = tokio::join!(
            handshake(&mut a, &id_a, &room, &a_log, &config),
            handshake(&mut b, &id_b, &room, &b_log, &config),
        );
        assert!(matches!(ra, Err(SessionError::Diverged { sequence: 1 })));
    }

    #[tokio::test]
    async fn test_handshake_rejects_self() {
        let room = room();
        let config = ReplicationConfig::default();
        let id = PeerId::random();
        let log = log_with(&room, 0);
        let (mut a, mut b) = duplex(4096);

        let (ra, _) = tokio::join!(
            handshake(&mut a, &id, &room, &log, &config),
            handshake(&mut b, &id, &room, &log, &config),
        );
        assert!(matches!(ra, Err(SessionError::SelfConnection)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_times_out() {
        let room = room();
        let config = ReplicationConfig::default();
        let log = log_with(&room, 0);
        let (mut a, _b) = duplex(4096);

        let result = handshake(&mut a, &PeerId::random(), &room, &log, &config).await;
        assert!(matches!(result, Err(SessionError::HandshakeTimeout)));
    }
}
