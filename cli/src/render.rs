// SPDX-License-Identifier: MIT OR Apache-2.0

//! Line-based rendering of log entries for the CLI.

use peerchat_core::Entry;

/// One role-tagged line per entry
pub fn render_entry(entry: &Entry) -> String {
    format!("[{}] {}", entry.role, entry.content)
}

/// Entry with its sequence and short digest, for `--debug`
pub fn render_entry_debug(entry: &Entry) -> String {
    format!(
        "#{} {} [{}] {}",
        entry.sequence,
        entry.short_digest(),
        entry.role,
        entry.content
    )
}

/// Prompt shown before reading a line of input
pub fn prompt(writer: bool) -> &'static str {
    if writer {
        "You: "
    } else {
        "(read-only) "
    }
}
