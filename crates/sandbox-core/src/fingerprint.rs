//! Content fingerprints for extension source text.
//!
//! The host registry stores one fingerprint per loaded script and compares it
//! against the fingerprint of the desired source on every reconciliation.
//! Identical bytes produce identical fingerprints, which is what makes
//! reloads content-addressed: re-supplying the same script is a no-op, and a
//! one-character change triggers exactly one reload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Deterministic blake3 hash of script source text.
///
/// # Examples
///
/// ```
/// use sandbox_core::ContentFingerprint;
///
/// let a = ContentFingerprint::of("function getStreams() {}");
/// let b = ContentFingerprint::of("function getStreams() {}");
/// let c = ContentFingerprint::of("function getStreams() { }");
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    /// Computes the fingerprint of the given source text.
    #[must_use]
    pub fn of(source: &str) -> Self {
        Self(blake3::hash(source.as_bytes()).to_hex().to_string())
    }

    /// Returns the fingerprint as a lowercase hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated form for logs.
        write!(f, "{}", &self.0[..self.0.len().min(16)])
    }
}
