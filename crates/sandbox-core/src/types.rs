//! Strong domain types for the extension sandbox.
//!
//! Newtypes over primitives keep extension ids, call ids, and script text
//! from being mixed up at call sites.
//!
//! # Examples
//!
//! ```
//! use sandbox_core::{ExtensionId, CallId};
//!
//! let id = ExtensionId::new("torrent-streams");
//! let call = CallId::new(7);
//! assert_eq!(id.as_str(), "torrent-streams");
//! assert_eq!(call.value(), 7);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque stable identifier for one extension (newtype over `String`).
///
/// Uniqueness is the caller's responsibility; the host registry keys on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtensionId(String);

impl ExtensionId {
    /// Creates a new extension identifier.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id and returns the inner `String`.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Returns `true` if the id is empty. Empty ids are rejected by the
    /// host with `InvalidCall` before any message is sent.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ExtensionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExtensionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Correlation id for one in-flight call (newtype over `u64`).
///
/// Allocated by the host from a monotonically increasing counter scoped to
/// the dispatcher instance. Responses are matched to callers exclusively by
/// this id, never by arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    /// Creates a call id from a raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One desired extension as supplied by the caller: an id plus the plugin
/// source text. The host diffs an ordered list of these against its registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDefinition {
    /// Stable identifier, unique within the desired list.
    pub id: ExtensionId,
    /// Plugin source text. Must define a global `getStreams` function;
    /// `getConfigSchema` is optional.
    pub script: String,
}

impl ExtensionDefinition {
    /// Creates a definition from an id and source text.
    #[must_use]
    pub fn new(id: impl Into<ExtensionId>, script: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: script.into(),
        }
    }
}

/// Caller-visible lifecycle state of one extension id.
///
/// `Unregistered` means the id is absent from the registry; there is no
/// persisted unloaded state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionStatus {
    /// The id is not present in the registry.
    Unregistered,
    /// A `load` has been sent and no ack has arrived yet.
    Loading,
    /// The sandbox acked the load; calls are possible.
    Loaded,
    /// The last load failed; the reason is the sandbox-reported message.
    Errored(String),
}

impl ExtensionStatus {
    /// Returns `true` if calls against this id would be accepted.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_id_roundtrip() {
        let id = ExtensionId::new("abc");
        assert_eq!(id.as_str(), "abc");
        assert_eq!(id.to_string(), "abc");
        assert_eq!(id.clone().into_inner(), "abc");
        assert!(!id.is_empty());
        assert!(ExtensionId::new("").is_empty());
    }

    #[test]
    fn call_id_is_transparent_in_json() {
        let id = CallId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: CallId = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn status_loaded_predicate() {
        assert!(ExtensionStatus::Loaded.is_loaded());
        assert!(!ExtensionStatus::Loading.is_loaded());
        assert!(!ExtensionStatus::Errored("boom".into()).is_loaded());
        assert!(!ExtensionStatus::Unregistered.is_loaded());
    }
}
