//! Opaque concurrency tokens stamped on every package document mutation.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Revision token of a package document, rendered as `<seq>-<16 hex>`.
///
/// Callers only ever compare tokens for equality. The sequence prefix keeps tokens readable in
/// logs and the random suffix keeps two writers that raced from the same base apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Token for a freshly created document.
    pub fn initial() -> Self {
        Self::with_sequence(1)
    }

    /// Successor of this token. Foreign tokens without a numeric prefix restart at 1.
    pub fn next(&self) -> Self {
        Self::with_sequence(self.sequence().saturating_add(1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exact comparison against a token handed in by a caller.
    pub fn matches(&self, token: &str) -> bool {
        self.0 == token
    }

    fn sequence(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(seq, _)| seq.parse().ok())
            .unwrap_or(0)
    }

    fn with_sequence(seq: u64) -> Self {
        let nonce: u64 = rand::thread_rng().gen();
        Self(format!("{seq}-{nonce:016x}"))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Revision {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Revision {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
