// SPDX-License-Identifier: MIT OR Apache-2.0

//! peerchat core - hash-chained chat log and room identity
//!
//! This crate provides:
//! - the `Entry` type and the BLAKE3 chain rule that links entries
//! - `EntryLog`, an append-only log with live subscriptions
//! - room key handling and the identifiers derived from it
//! - optional JSON-lines persistence of a room's log
//! - the bounded context window handed to a completion backend

#![deny(unsafe_code)]
#![deny(clippy::all)]

pub mod context;
pub mod entry;
pub mod log;
pub mod room;
pub mod storage;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use context::{context_window, ChatMessage, DEFAULT_CONTEXT_WINDOW};
pub use entry::{calculate_entry_digest, verify_chain, Entry};
pub use log::{Applied, EntryLog, LogError, Subscription};
pub use room::{fresh_challenge, Challenge, RoomError, RoomIdentity, RoomKey, Topic};

/// 32-byte BLAKE3 digest
pub type Digest = [u8; 32];

/// Author of a chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions for the assistant, normally entry 0
    System,
    /// Human participant
    User,
    /// Model reply
    Assistant,
}

impl Role {
    /// Stable single-byte tag hashed into the chain
    pub fn tag(self) -> u8 {
        match self {
            Role::System => 0,
            Role::User => 1,
            Role::Assistant => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_str() {
        for role in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(role.to_string().parse::<Role>(), Ok(role));
        }
        assert!("moderator".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_tags_are_distinct() {
        assert_ne!(Role::System.tag(), Role::User.tag());
        assert_ne!(Role::User.tag(), Role::Assistant.tag());
        assert_ne!(Role::System.tag(), Role::Assistant.tag());
    }
}
