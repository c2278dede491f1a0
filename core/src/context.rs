// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded conversation context handed to a completion backend

use serde::{Deserialize, Serialize};

use crate::{Entry, Role};

/// Number of recent entries sent along with the pinned system prompt
pub const DEFAULT_CONTEXT_WINDOW: usize = 30;

/// One message in the `{role, content}` shape chat completion APIs expect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Entry> for ChatMessage {
    fn from(entry: &Entry) -> Self {
        Self {
            role: entry.role,
            content: entry.content.clone(),
        }
    }
}

/// The last `window` entries, with a leading system entry always kept
pub fn context_window(entries: &[Entry], window: usize) -> Vec<ChatMessage> {
    let pinned = entries.first().filter(|e| e.role == Role::System);

    match pinned {
        Some(system) if entries.len() > window + 1 => {
            let start = entries.len() - window;
            std::iter::once(system)
                .chain(&entries[start..])
                .map(ChatMessage::from)
                .collect()
        }
        Some(_) => entries.iter().map(ChatMessage::from).collect(),
        None => {
            let start = entries.len().saturating_sub(window);
            entries[start..].iter().map(ChatMessage::from).collect()
        }
    }
}
