// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session frame encryption
//!
//! Each side of a handshake sends a fresh `Challenge` nonce. Every direction
//! of the session then gets its own ChaCha20-Poly1305 key, derived from the
//! room's auth key and both nonces, and frames carry a per-direction counter
//! as their AEAD nonce. A peer without the room key can neither read frames
//! nor produce ones the other side will open.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use peerchat_core::{Challenge, RoomIdentity};

use super::wire::{decode, Message, WireError};

/// Poly1305 tag appended to every sealed frame
pub const TAG_LEN: usize = 16;

fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Outbound half of a session cipher
pub struct FrameSealer {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl FrameSealer {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, WireError> {
        let nonce = counter_nonce(self.counter);
        self.counter = self.counter.checked_add(1).ok_or(WireError::Seal)?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| WireError::Seal)
    }
}

/// Inbound half of a session cipher
pub struct FrameOpener {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl FrameOpener {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    /// Decrypt and decode the next frame.
    ///
    /// Frames must arrive in the order they were sealed; a dropped, replayed
    /// or reordered frame fails authentication.
    pub fn open(&mut self, sealed: &[u8]) -> Result<Message, WireError> {
        let nonce = counter_nonce(self.counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed)
            .map_err(|_| WireError::Unauthenticated)?;
        self.counter += 1;
        decode(&plaintext)
    }
}

/// Both directions of one session's encryption
pub struct SessionCipher {
    pub sealer: FrameSealer,
    pub opener: FrameOpener,
}

impl SessionCipher {
    pub fn new(room: &RoomIdentity, local: &Challenge, remote: &Challenge) -> Self {
        Self {
            sealer: FrameSealer::new(&room.session_key(local, remote)),
            opener: FrameOpener::new(&room.session_key(remote, local)),
        }
    }

    pub fn split(self) -> (FrameSealer, FrameOpener) {
        (self.sealer, self.opener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::wire::encode;
    use peerchat_core::{fresh_challenge, RoomKey};
    use proptest::prelude::*;

    fn pair(room: &RoomIdentity) -> (SessionCipher, SessionCipher) {
        let (a, b) = (fresh_challenge(), fresh_challenge());
        (SessionCipher::new(room, &a, &b), SessionCipher::new(room, &b, &a))
    }

    #[test]
    fn test_frames_open_on_the_other_side_only() {
        let room = RoomIdentity::derive(&RoomKey::generate());
        let (mut a, mut b) = pair(&room);
        let message = Message::bye("see you");

        let sealed = a.sealer.seal(&encode(&message).unwrap()).unwrap();
        assert_eq!(sealed.len(), encode(&message).unwrap().len() + TAG_LEN);
        assert_eq!(b.opener.open(&sealed).unwrap(), message);

        // Our own inbound key is a different key
        let sealed = a.sealer.seal(&encode(&message).unwrap()).unwrap();
        assert!(matches!(a.opener.open(&sealed), Err(WireError::Unauthenticated)));
    }

    #[test]
    fn test_replayed_and_tampered_frames_fail() {
        let room = RoomIdentity::derive(&RoomKey::generate());
        let (mut a, mut b) = pair(&room);
        let body = encode(&Message::Request { from: 0, to: 64 }).unwrap();

        let first = a.sealer.seal(&body).unwrap();
        b.opener.open(&first).unwrap();
        assert!(matches!(b.opener.open(&first), Err(WireError::Unauthenticated)));

        let (mut a, mut b) = pair(&room);
        let mut sealed = a.sealer.seal(&body).unwrap();
        sealed[0] ^= 1;
        assert!(matches!(b.opener.open(&sealed), Err(WireError::Unauthenticated)));
    }

    proptest! {
        #[test]
        fn prop_any_flipped_byte_fails_authentication(
            content in ".{0,64}",
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let room = RoomIdentity::derive(&RoomKey::from_bytes(&[7u8; 16]).unwrap());
            let (mut a, mut b) = pair(&room);
            let message = Message::bye(content);
            let mut sealed = a.sealer.seal(&encode(&message).unwrap()).unwrap();

            let at = index.index(sealed.len());
            sealed[at] ^= 1 << bit;
            prop_assert!(matches!(b.opener.open(&sealed), Err(WireError::Unauthenticated)));
        }
    }

    #[test]
    fn test_other_room_cannot_open() {
        let room = RoomIdentity::derive(&RoomKey::generate());
        let other = RoomIdentity::derive(&RoomKey::generate());
        let (a_nonce, b_nonce) = (fresh_challenge(), fresh_challenge());
        let mut a = SessionCipher::new(&room, &a_nonce, &b_nonce);
        let mut outsider = SessionCipher::new(&other, &b_nonce, &a_nonce);

        let sealed = a.sealer.seal(&encode(&Message::bye("x")).unwrap()).unwrap();
        assert!(matches!(outsider.opener.open(&sealed), Err(WireError::Unauthenticated)));
    }
}
