// src/revision.rs
// Revision codec: parses/produces revisions shaped "<height>-<hash>" and
// computes a stable, content-derived hash of a document body.

use std::cmp::Ordering;
use std::fmt;

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::error::{Result, StorageError};

/// Keys stripped before hashing a document body. `_rev` carries the
/// revision itself (hashing it would make every update self-referential);
/// `_meta`/`$lastWriteAt` are engine-private bookkeeping, not content.
const STRIPPED_KEYS: [&str; 3] = ["_rev", "_meta", "$lastWriteAt"];

/// A parsed revision: `{height}-{hash}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    pub height: u64,
    pub hash: String,
}

impl Revision {
    pub fn new(height: u64, hash: String) -> Self {
        Revision { height, hash }
    }

    /// Parse `"H-Hash"` into its components.
    pub fn parse(rev: &str) -> Result<Revision> {
        let (height_str, hash) = rev
            .split_once('-')
            .ok_or_else(|| StorageError::InvalidRevision(rev.to_string()))?;
        let height: u64 = height_str
            .parse()
            .map_err(|_| StorageError::InvalidRevision(rev.to_string()))?;
        if height == 0 || hash.is_empty() {
            return Err(StorageError::InvalidRevision(rev.to_string()));
        }
        Ok(Revision {
            height,
            hash: hash.to_string(),
        })
    }

    /// `getHeightOfRevision`.
    pub fn height_of(rev: &str) -> Result<u64> {
        Ok(Revision::parse(rev)?.height)
    }

    /// The next revision after this one, hashing `doc`.
    pub fn next(&self, doc: &Value) -> Revision {
        Revision::new(self.height + 1, create_revision_hash(doc))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

/// Ordering used only by `bulkAddRevisions`: strictly by height ascending,
/// ties broken by lexicographic hash ascending.
impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

/// `createRevision(doc)`: a deterministic hash of the document body,
/// excluding `_rev`, `_meta`, and other engine-private fields. Collision
/// resistance is not required, only stability for identical content.
pub fn create_revision_hash(doc: &Value) -> String {
    let canonical = canonicalize(doc);
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    // Truncate to 16 hex chars (8 bytes) - stability across reruns
    // matters here, not collision resistance.
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// The first revision assigned to a brand-new document.
pub fn first_revision(doc: &Value) -> Revision {
    Revision::new(1, create_revision_hash(doc))
}

/// Produce a canonical (key-sorted, engine-field-stripped) JSON encoding
/// of a document body so that semantically identical documents hash
/// identically regardless of field insertion order.
fn canonicalize(doc: &Value) -> String {
    match doc {
        Value::Object(map) => {
            let mut sorted = Map::new();
            let mut keys: Vec<&String> = map.keys().filter(|k| !STRIPPED_KEYS.contains(&k.as_str())).collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), map[key].clone());
            }
            serde_json::to_string(&canonicalize_value(&Value::Object(sorted))).unwrap_or_default()
        }
        other => serde_json::to_string(&canonicalize_value(other)).unwrap_or_default(),
    }
}

/// Recursively sort nested object keys so the canonical form is stable
/// at every depth, not just the top level.
fn canonicalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), canonicalize_value(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_value).collect()),
        other => other.clone(),
    }
}
