// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turns lines of user input into log entries and assistant replies

use anyhow::Result;
use peerchat_core::{context_window, Entry, EntryLog, Role};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::completion::CompletionBackend;

/// System prompt a writer seeds an empty room with
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// What became of one line of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Turn {
    /// User entry and the assistant's reply were appended
    Replied { user: Entry, reply: Entry },
    /// User entry was appended but the backend failed
    CompletionFailed { user: Entry, error: String },
    /// This process is a replica and may not append
    Refused,
    /// Blank line
    Ignored,
    Exit,
}

/// Drives one participant's side of the conversation
pub struct ChatOrchestrator<B> {
    log: Arc<EntryLog>,
    backend: Option<B>,
    window: usize,
}

impl<B: CompletionBackend> ChatOrchestrator<B> {
    /// Orchestrator that appends turns and replies
    pub fn writer(log: Arc<EntryLog>, backend: B, window: usize) -> Self {
        Self {
            log,
            backend: Some(backend),
            window,
        }
    }

    /// Orchestrator for a read-only replica
    pub fn replica(log: Arc<EntryLog>) -> Self {
        Self {
            log,
            backend: None,
            window: 0,
        }
    }

    pub fn is_writer(&self) -> bool {
        self.backend.is_some()
    }

    pub fn log(&self) -> &Arc<EntryLog> {
        &self.log
    }

    /// Append the system prompt if this writer's room is still empty.
    /// Returns whether it was appended.
    pub fn seed_system_prompt(&self) -> Result<bool> {
        if !self.is_writer() || !self.log.is_empty() {
            return Ok(false);
        }
        self.log.append(Role::System, SYSTEM_PROMPT)?;
        Ok(true)
    }

    /// Handle one line typed by the user
    pub async fn handle_line(&self, line: &str) -> Result<Turn> {
        let input = line.trim();
        if input.eq_ignore_ascii_case("exit") {
            return Ok(Turn::Exit);
        }
        if input.is_empty() {
            return Ok(Turn::Ignored);
        }
        let Some(backend) = &self.backend else {
            return Ok(Turn::Refused);
        };

        let user = self.log.append_async(Role::User, input).await?;
        let context = context_window(&self.log.snapshot(), self.window);
        debug!(sequence = user.sequence, context = context.len(), "Requesting completion");

        match backend.complete(&context).await {
            Ok(content) => {
                let reply = self.log.append_async(Role::Assistant, content).await?;
                Ok(Turn::Replied { user, reply })
            }
            Err(e) => {
                warn!(sequence = user.sequence, "Completion failed: {:#}", e);
                Ok(Turn::CompletionFailed {
                    user,
                    error: format!("{e:#}"),
                })
            }
        }
    }
}
