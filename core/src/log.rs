// SPDX-License-Identifier: MIT OR Apache-2.0

//! Append-only entry log with live subscriptions
//!
//! Appends and replica applies are serialized by a writer mutex. Readers
//! take a shared lock on the entry vector and never see a partial entry.
//! A persisted log syncs its file while holding that mutex, so async
//! callers go through `append_async` and `apply_async`, which run the
//! write on tokio's blocking pool.
//! The current length is published on a `watch` channel which
//! subscriptions wait on once they have drained the history.

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::storage::LogFile;
use crate::{Digest, Entry, Role};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("sequence {sequence} is out of range (length {length})")]
    OutOfRange { sequence: u64, length: u64 },

    #[error("entry {sequence} diverges from the local log")]
    Diverged { sequence: u64 },

    #[error("entry {sequence} arrived out of order, expected {expected}")]
    OutOfOrder { sequence: u64, expected: u64 },

    #[error("entry {sequence} failed chain verification")]
    VerificationFailed { sequence: u64 },

    #[error("log file corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("log storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("log file unusable after a write that could not be rolled back")]
    StorageFailed,
}

/// Result of applying a replicated entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The entry extended the log
    Applied,
    /// The log already held an identical entry at that sequence
    Duplicate,
}

/// Ordered, hash-chained log of a room's chat entries
pub struct EntryLog {
    chain_seed: Digest,
    persisted: bool,
    writer: Mutex<Option<LogFile>>,
    entries: RwLock<Vec<Entry>>,
    length: watch::Sender<u64>,
}

impl EntryLog {
    /// Empty in-memory log
    pub fn new(chain_seed: Digest) -> Self {
        Self::from_parts(chain_seed, None, Vec::new())
    }

    /// Log backed by the file at `path`, replaying and verifying what it holds
    pub fn open(chain_seed: Digest, path: impl AsRef<Path>) -> Result<Self, LogError> {
        let (file, entries) = LogFile::open(path, &chain_seed)?;
        tracing::info!(
            path = ?file.path(),
            length = entries.len(),
            "Opened persisted log"
        );
        Ok(Self::from_parts(chain_seed, Some(file), entries))
    }

    fn from_parts(chain_seed: Digest, file: Option<LogFile>, entries: Vec<Entry>) -> Self {
        let (length, _) = watch::channel(entries.len() as u64);
        Self {
            chain_seed,
            persisted: file.is_some(),
            writer: Mutex::new(file),
            entries: RwLock::new(entries),
            length,
        }
    }

    /// Append a locally authored entry
    pub fn append(&self, role: Role, content: impl Into<String>) -> Result<Entry, LogError> {
        let mut writer = self.writer.lock();

        let entry = {
            let entries = self.entries.read();
            let previous = entries.last().map(|e| e.digest).unwrap_or(self.chain_seed);
            Entry::next(entries.len() as u64, role, content, &previous)
        };

        self.commit(&mut writer, entry.clone())?;
        tracing::debug!(sequence = entry.sequence, role = %entry.role, "Appended entry");
        Ok(entry)
    }

    /// Append an entry received from a peer after checking position and chain
    pub fn apply(&self, entry: Entry) -> Result<Applied, LogError> {
        let mut writer = self.writer.lock();

        let previous = {
            let entries = self.entries.read();
            let length = entries.len() as u64;

            if entry.sequence < length {
                let held = &entries[entry.sequence as usize];
                return if held.digest == entry.digest {
                    Ok(Applied::Duplicate)
                } else {
                    Err(LogError::Diverged { sequence: entry.sequence })
                };
            }
            if entry.sequence > length {
                return Err(LogError::OutOfOrder {
                    sequence: entry.sequence,
                    expected: length,
                });
            }
            entries.last().map(|e| e.digest).unwrap_or(self.chain_seed)
        };

        if !entry.verify(&previous) {
            return Err(LogError::VerificationFailed { sequence: entry.sequence });
        }

        self.commit(&mut writer, entry)?;
        Ok(Applied::Applied)
    }

    /// `append` that keeps file I/O off the calling runtime worker
    pub async fn append_async(
        self: &Arc<Self>,
        role: Role,
        content: impl Into<String>,
    ) -> Result<Entry, LogError> {
        let content = content.into();
        if !self.persisted {
            return self.append(role, content);
        }
        let log = Arc::clone(self);
        offload(move || log.append(role, content)).await
    }

    /// `apply` that keeps file I/O off the calling runtime worker
    pub async fn apply_async(self: &Arc<Self>, entry: Entry) -> Result<Applied, LogError> {
        if !self.persisted {
            return self.apply(entry);
        }
        let log = Arc::clone(self);
        offload(move || log.apply(entry)).await
    }

    /// Whether appends are written to a file
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    fn commit(&self, writer: &mut Option<LogFile>, entry: Entry) -> Result<(), LogError> {
        if let Some(file) = writer.as_mut() {
            file.append(&entry)?;
        }
        let length = {
            let mut entries = self.entries.write();
            entries.push(entry);
            entries.len() as u64
        };
        self.length.send_replace(length);
        Ok(())
    }

    pub fn get(&self, sequence: u64) -> Result<Entry, LogError> {
        let entries = self.entries.read();
        entries
            .get(sequence as usize)
            .cloned()
            .ok_or(LogError::OutOfRange {
                sequence,
                length: entries.len() as u64,
            })
    }

    pub fn length(&self) -> u64 {
        self.entries.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Digest of the newest entry, or the chain seed when empty
    pub fn last_digest(&self) -> Digest {
        self.entries
            .read()
            .last()
            .map(|e| e.digest)
            .unwrap_or(self.chain_seed)
    }

    /// Length and last digest read under one lock
    pub fn head(&self) -> (u64, Digest) {
        let entries = self.entries.read();
        let digest = entries.last().map(|e| e.digest).unwrap_or(self.chain_seed);
        (entries.len() as u64, digest)
    }

    pub fn chain_seed(&self) -> Digest {
        self.chain_seed
    }

    /// Digest the chain has after its first `length` entries.
    ///
    /// `None` when the log is shorter than `length`.
    pub fn digest_at_length(&self, length: u64) -> Option<Digest> {
        if length == 0 {
            return Some(self.chain_seed);
        }
        self.entries
            .read()
            .get(length as usize - 1)
            .map(|e| e.digest)
    }

    /// Entries with `from <= sequence < to`, clamped to the current length
    pub fn range(&self, from: u64, to: u64) -> Vec<Entry> {
        let entries = self.entries.read();
        let end = (to as usize).min(entries.len());
        let start = (from as usize).min(end);
        entries[start..end].to_vec()
    }

    /// The newest `n` entries, oldest first
    pub fn tail(&self, n: usize) -> Vec<Entry> {
        let entries = self.entries.read();
        let start = entries.len().saturating_sub(n);
        entries[start..].to_vec()
    }

    /// Every entry, oldest first
    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries.read().clone()
    }

    /// Recompute `entry`'s digest from its fields and `previous`
    pub fn verify(entry: &Entry, previous: &Digest) -> bool {
        entry.verify(previous)
    }

    /// Receiver that changes whenever the length grows
    pub fn watch_length(&self) -> watch::Receiver<u64> {
        self.length.subscribe()
    }

    /// Resolve once the log holds at least `length` entries
    pub async fn wait_for_length(&self, length: u64) {
        let mut rx = self.length.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|current| *current >= length).await;
    }

    /// Every entry from `from` onward, then each new one as it is appended
    pub fn subscribe(self: &Arc<Self>, from: u64) -> Subscription {
        Subscription {
            log: Arc::clone(self),
            length: self.length.subscribe(),
            next: from,
        }
    }
}

async fn offload<T, F>(write: F) -> Result<T, LogError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LogError> + Send + 'static,
{
    tokio::task::spawn_blocking(write)
        .await
        .map_err(|e| LogError::Storage(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

impl std::fmt::Debug for EntryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryLog")
            .field("length", &self.length())
            .field("persisted", &self.persisted)
            .finish()
    }
}

/// Live cursor over an `EntryLog`
pub struct Subscription {
    log: Arc<EntryLog>,
    length: watch::Receiver<u64>,
    next: u64,
}

impl Subscription {
    /// Sequence of the entry the next call will yield
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Move forward to `sequence`; never moves backward
    pub fn skip_to(&mut self, sequence: u64) {
        self.next = self.next.max(sequence);
    }

    /// Next entry if it is already in the log
    pub fn try_next(&mut self) -> Option<Entry> {
        let entry = self.log.get(self.next).ok()?;
        self.next += 1;
        Some(entry)
    }

    /// Wait for the next entry. Cancel safe.
    pub async fn next(&mut self) -> Entry {
        loop {
            self.length.borrow_and_update();
            if let Some(entry) = self.try_next() {
                return entry;
            }
            if self.length.changed().await.is_err() {
                // Unreachable while we hold the log, but never spin.
                futures::future::pending::<()>().await;
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Entry> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let entry = sub.next().await;
            Some((entry, sub))
        })
    }
}
