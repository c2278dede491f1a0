// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON-lines persistence for a room's log
//!
//! One serialized `Entry` per line, appended and synced before the entry
//! becomes visible in memory. Reopening replays and re-verifies the chain.
//! An append that fails part way is cut back off the file, so the file
//! only ever holds whole, committed lines.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::log::LogError;
use crate::{Digest, Entry, Topic};

/// File name used for a room's persisted log
pub fn history_file_name(topic: &Topic) -> String {
    format!("history_{}.jsonl", topic)
}

/// Byte sink a `LogFile` appends to
pub trait LogTarget: Write {
    /// Flush written bytes to durable storage
    fn sync(&mut self) -> io::Result<()>;

    /// Cut the target back to `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogTarget for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_data()
    }
}

/// Append handle on a persisted log
#[derive(Debug)]
pub struct LogFile<T: LogTarget = File> {
    path: PathBuf,
    target: T,
    /// Bytes of whole, synced lines
    committed: u64,
    /// Set when a failed append could not be cut back off
    failed: bool,
}

impl LogFile {
    /// Open or create the file at `path` and replay its entries.
    ///
    /// A final line without a trailing newline is the remains of an
    /// interrupted append and is cut off. Any other bad line fails with
    /// `LogError::Corrupt`.
    pub fn open(path: impl AsRef<Path>, chain_seed: &Digest) -> Result<(Self, Vec<Entry>), LogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut entries: Vec<Entry> = Vec::new();
        let mut previous = *chain_seed;
        let mut offset = 0usize;
        let mut line_no = 0usize;

        while offset < bytes.len() {
            let rest = &bytes[offset..];
            line_no += 1;

            let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
                tracing::warn!(
                    path = ?path,
                    line = line_no,
                    bytes = rest.len(),
                    "Truncating torn final line in log file"
                );
                file.set_len(offset as u64)?;
                break;
            };

            let line = &rest[..newline];
            offset += newline + 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let entry: Entry = serde_json::from_slice(line).map_err(|e| LogError::Corrupt {
                line: line_no,
                reason: e.to_string(),
            })?;

            let expected = entries.len() as u64;
            if entry.sequence != expected {
                return Err(LogError::Corrupt {
                    line: line_no,
                    reason: format!("sequence {} where {} was expected", entry.sequence, expected),
                });
            }
            if !entry.verify(&previous) {
                return Err(LogError::Corrupt {
                    line: line_no,
                    reason: format!("entry {} does not verify against its predecessor", entry.sequence),
                });
            }

            previous = entry.digest;
            entries.push(entry);
        }

        tracing::debug!(path = ?path, entries = entries.len(), "Log file replayed");
        Ok((Self::with_target(path, file, offset as u64), entries))
    }
}

impl<T: LogTarget> LogFile<T> {
    fn with_target(path: PathBuf, target: T, committed: u64) -> Self {
        Self {
            path,
            target,
            committed,
            failed: false,
        }
    }

    /// Write one entry and sync it to disk.
    ///
    /// On a failed write or sync the partial line is truncated away and the
    /// error returned. If that truncation fails too the handle refuses every
    /// later append with `LogError::StorageFailed`.
    pub fn append(&mut self, entry: &Entry) -> Result<(), LogError> {
        if self.failed {
            return Err(LogError::StorageFailed);
        }

        let mut line = serde_json::to_vec(entry).map_err(io::Error::from)?;
        line.push(b'\n');

        let written = self
            .target
            .write_all(&line)
            .and_then(|()| self.target.sync());
        if let Err(e) = written {
            match self.target.truncate(self.committed) {
                Ok(()) => tracing::warn!(
                    path = ?self.path,
                    sequence = entry.sequence,
                    error = %e,
                    "Append failed, partial line rolled back"
                ),
                Err(rollback) => {
                    self.failed = true;
                    tracing::error!(
                        path = ?self.path,
                        sequence = entry.sequence,
                        error = %e,
                        rollback = %rollback,
                        "Append failed and could not be rolled back"
                    );
                }
            }
            return Err(e.into());
        }

        self.committed += line.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
