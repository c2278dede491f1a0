// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chat entries and the hash chain that links them

use serde::{Deserialize, Serialize};

use crate::{Digest, Role};

/// One chat turn in a room's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Position in the log, 0-based and dense
    pub sequence: u64,
    /// Who produced the turn
    pub role: Role,
    /// UTF-8 message text
    pub content: String,
    /// Chain digest over the fields above and the previous entry's digest
    #[serde(with = "hex_digest")]
    pub digest: Digest,
}

impl Entry {
    /// Build the entry that follows `previous` in the chain
    pub fn next(sequence: u64, role: Role, content: impl Into<String>, previous: &Digest) -> Self {
        let content = content.into();
        let digest = calculate_entry_digest(sequence, role, &content, previous);
        Self {
            sequence,
            role,
            content,
            digest,
        }
    }

    /// Recompute the digest from the fields and compare it with the stored one
    pub fn verify(&self, previous: &Digest) -> bool {
        calculate_entry_digest(self.sequence, self.role, &self.content, previous) == self.digest
    }

    /// First 8 bytes of the digest as hex, for log lines
    pub fn short_digest(&self) -> String {
        hex::encode(&self.digest[..8])
    }
}

/// Digest of one link in the chain.
///
/// The content length is hashed ahead of the content so that no two
/// (role, content) pairs share a byte encoding.
pub fn calculate_entry_digest(sequence: u64, role: Role, content: &str, previous: &Digest) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(previous);
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&[role.tag()]);
    hasher.update(&(content.len() as u64).to_le_bytes());
    hasher.update(content.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Verify a contiguous run of entries starting right after `previous`.
///
/// Returns the sequence of the first entry that breaks the chain.
pub fn verify_chain<'a>(
    entries: impl IntoIterator<Item = &'a Entry>,
    first_sequence: u64,
    previous: &Digest,
) -> Result<Digest, u64> {
    let mut running = *previous;
    let mut expected = first_sequence;
    for entry in entries {
        if entry.sequence != expected || !entry.verify(&running) {
            tracing::warn!(
                sequence = entry.sequence,
                expected,
                digest = %entry.short_digest(),
                "Entry chain integrity violation"
            );
            return Err(entry.sequence);
        }
        running = entry.digest;
        expected += 1;
    }
    Ok(running)
}

mod hex_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use crate::Digest;

    pub fn serialize<S: Serializer>(digest: &Digest, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(digest))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Digest, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("digest must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: Digest = [7u8; 32];

    #[test]
    fn test_entry_verifies_against_its_predecessor() {
        let first = Entry::next(0, Role::System, "You are a helpful assistant.", &SEED);
        let second = Entry::next(1, Role::User, "hi", &first.digest);

        assert!(first.verify(&SEED));
        assert!(second.verify(&first.digest));
        assert!(!second.verify(&SEED));
    }

    #[test]
    fn test_field_changes_break_the_digest() {
        let entry = Entry::next(3, Role::User, "hello", &SEED);

        let mut tampered = entry.clone();
        tampered.content.push('!');
        assert!(!tampered.verify(&SEED));

        let mut tampered = entry.clone();
        tampered.role = Role::Assistant;
        assert!(!tampered.verify(&SEED));

        let mut tampered = entry;
        tampered.sequence = 4;
        assert!(!tampered.verify(&SEED));
    }

    #[test]
    fn test_verify_chain_reports_first_break() {
        let mut entries = Vec::new();
        let mut prev = SEED;
        for i in 0..5u64 {
            let entry = Entry::next(i, Role::User, format!("msg {i}"), &prev);
            prev = entry.digest;
            entries.push(entry);
        }
        assert_eq!(verify_chain(&entries, 0, &SEED), Ok(prev));

        entries[3].content = "edited".to_string();
        assert_eq!(verify_chain(&entries, 0, &SEED), Err(3));
    }

    #[test]
    fn test_json_digest_is_hex() {
        let entry = Entry::next(0, Role::Assistant, "ok", &SEED);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(&hex::encode(entry.digest)));

        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
