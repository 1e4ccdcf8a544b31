//! Revision identifiers of the form `<generation>-<suffix>`.
//!
//! Locally generated ids hash the parent revision, the deletion flag and the
//! canonical body, so two replicas making the same edit on the same parent
//! produce the same id. Ids received from a remote are treated as opaque
//! comparison keys.
//!
//! Ordering is CouchDB-compatible: generation first (numerically), then the
//! suffix compared byte-wise. Never compare suffixes with a locale-aware
//! collation; replicas would disagree on the winning revision.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};

/// Number of hex characters kept from the SHA-256 digest.
const SUFFIX_LEN: usize = 32;

/// A parsed, validated revision id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    raw: String,
    generation: u64,
}

impl RevisionId {
    /// Parse and validate a revision id.
    ///
    /// The generation must be a positive decimal integer without sign or
    /// leading zeros, and the suffix non-empty. Equality and hashing use the
    /// raw string, so only one spelling of a generation is accepted.
    pub fn parse(raw: &str) -> Result<Self> {
        let (generation, suffix) = raw
            .split_once('-')
            .ok_or_else(|| SyncError::InvalidArgument(format!("malformed revision id '{raw}'")))?;
        if generation.starts_with('0') || !generation.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SyncError::InvalidArgument(format!(
                "revision id '{raw}' has a non-canonical generation"
            )));
        }
        let generation: u64 = generation.parse().map_err(|_| {
            SyncError::InvalidArgument(format!("revision id '{raw}' has a non-numeric generation"))
        })?;
        if generation == 0 || suffix.is_empty() {
            return Err(SyncError::InvalidArgument(format!(
                "malformed revision id '{raw}'"
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
            generation,
        })
    }

    /// Generate the id of a new revision whose parent is `parent`.
    ///
    /// A `None` parent yields a generation-1 id.
    pub fn generate(parent: Option<&RevisionId>, deleted: bool, body: &[u8]) -> Self {
        let generation = parent.map_or(1, |p| p.generation + 1);

        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.raw.as_bytes());
        }
        hasher.update([0u8, deleted as u8]);
        hasher.update(body);
        let digest = hex::encode(hasher.finalize());

        Self {
            raw: format!("{generation}-{}", &digest[..SUFFIX_LEN]),
            generation,
        }
    }

    /// Generation component.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Opaque suffix after the first `-`.
    pub fn suffix(&self) -> &str {
        self.raw
            .split_once('-')
            .map(|(_, suffix)| suffix)
            .unwrap_or_default()
    }

    /// The full id string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.suffix().as_bytes().cmp(other.suffix().as_bytes()))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for RevisionId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RevisionId> for String {
    fn from(rev: RevisionId) -> Self {
        rev.raw
    }
}

impl AsRef<str> for RevisionId {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}
