// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocols spoken between peers of a room
//!
//! Discovery finds peers; replication keeps their logs in sync over the
//! framed wire format, sealed per session.

pub mod peer_discovery;
pub mod replication;
pub mod secure;
pub mod wire;

pub use peer_discovery::{Discovery, JoinOptions, PeerCandidate};
pub use replication::{Established, ReplicationSession, SessionState};
pub use secure::SessionCipher;
pub use wire::{Message, PROTOCOL_VERSION};
