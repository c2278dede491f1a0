// SPDX-License-Identifier: MIT OR Apache-2.0

//! peerchat CLI - chat orchestration on top of a replicated room log
//!
//! The writer of a room appends user turns and asks a completion backend
//! for each reply; every participant renders entries as they arrive.

#![deny(unsafe_code)]

pub mod chat;
pub mod completion;
pub mod render;

pub use chat::{ChatOrchestrator, Turn, SYSTEM_PROMPT};
pub use completion::{CompletionBackend, OpenAiBackend};
