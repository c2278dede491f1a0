// SPDX-License-Identifier: MIT OR Apache-2.0

//! Room keys and the identifiers derived from them

use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::Digest;

const TOPIC_CONTEXT: &str = "peerchat 2024-06 room topic";
const CHAIN_SEED_CONTEXT: &str = "peerchat 2024-06 room chain seed";
const AUTH_KEY_CONTEXT: &str = "peerchat 2024-06 room membership key";
const PROOF_LABEL: &[u8] = b"membership proof";
const SESSION_KEY_LABEL: &[u8] = b"session key";

/// Length of a freshly generated room key in bytes
pub const ROOM_KEY_LEN: usize = 16;
const MIN_ROOM_KEY_LEN: usize = 16;
const MAX_ROOM_KEY_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("invalid room key: {0}")]
    InvalidRoomKey(String),
}

/// Shared secret naming a room
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey(Vec<u8>);

impl RoomKey {
    /// 128 random bits from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; ROOM_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RoomError> {
        if !(MIN_ROOM_KEY_LEN..=MAX_ROOM_KEY_LEN).contains(&bytes.len()) {
            return Err(RoomError::InvalidRoomKey(format!(
                "expected {}..={} bytes, got {}",
                MIN_ROOM_KEY_LEN,
                MAX_ROOM_KEY_LEN,
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for RoomKey {
    type Err = RoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| RoomError::InvalidRoomKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

// Keep the secret out of debug logs.
impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoomKey({} bytes)", self.0.len())
    }
}

/// Random nonce each side of a handshake contributes
pub type Challenge = [u8; 32];

/// 256 random bits from the OS RNG, never reused across handshakes
pub fn fresh_challenge() -> Challenge {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Discovery rendezvous identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(pub Digest);

impl Topic {
    pub fn as_bytes(&self) -> &Digest {
        &self.0
    }

    /// First 8 hex chars, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.short())
    }
}

/// Everything a process needs to take part in a room.
///
/// Derived one way from the `RoomKey`; the key itself is not kept.
#[derive(Clone)]
pub struct RoomIdentity {
    pub topic: Topic,
    pub chain_seed: Digest,
    auth_key: Digest,
}

impl RoomIdentity {
    pub fn derive(key: &RoomKey) -> Self {
        Self {
            topic: Topic(blake3::derive_key(TOPIC_CONTEXT, key.as_bytes())),
            chain_seed: blake3::derive_key(CHAIN_SEED_CONTEXT, key.as_bytes()),
            auth_key: blake3::derive_key(AUTH_KEY_CONTEXT, key.as_bytes()),
        }
    }

    /// Answer to the remote's `challenge`, binding `peer` to room membership
    pub fn membership_proof(&self, challenge: &Challenge, peer: &[u8]) -> Digest {
        let mut hasher = blake3::Hasher::new_keyed(&self.auth_key);
        hasher.update(PROOF_LABEL);
        hasher.update(challenge);
        hasher.update(peer);
        *hasher.finalize().as_bytes()
    }

    /// Constant-time check of a proof `peer` sent in answer to our `challenge`
    pub fn check_membership(&self, challenge: &Challenge, peer: &[u8], proof: &Digest) -> bool {
        let expected = blake3::Hash::from(self.membership_proof(challenge, peer));
        expected == blake3::Hash::from(*proof)
    }

    /// Frame key for one direction of a session.
    ///
    /// The side that sent `sender` encrypts with it; the side that sent
    /// `receiver` decrypts. Swapping the arguments gives the other direction.
    pub fn session_key(&self, sender: &Challenge, receiver: &Challenge) -> Digest {
        let mut hasher = blake3::Hasher::new_keyed(&self.auth_key);
        hasher.update(SESSION_KEY_LABEL);
        hasher.update(sender);
        hasher.update(receiver);
        *hasher.finalize().as_bytes()
    }
}

impl fmt::Debug for RoomIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomIdentity")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
