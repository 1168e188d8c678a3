//! Shared contract between the extension host and the sandbox.
//!
//! This crate defines everything that crosses the host/sandbox boundary:
//! - Strong id types (`ExtensionId`, `CallId`) and the caller-facing
//!   `ExtensionDefinition` / `ExtensionStatus`
//! - Content fingerprints used to detect script changes
//! - The message protocol (`Message`) exchanged over the sandbox channel
//! - The error taxonomy and its stable wire form (`ErrorInfo`)
//!
//! Nothing in here has behavior beyond validation and (de)serialization;
//! the host and sandbox crates supply the logic.

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

mod error;
mod fingerprint;
pub mod protocol;
mod types;

pub use error::{Error, ErrorInfo, Result};
pub use fingerprint::ContentFingerprint;
pub use protocol::Message;
pub use types::{CallId, ExtensionDefinition, ExtensionId, ExtensionStatus};

/// Default sandbox-side execution timeout for a single plugin call.
pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 30_000;

/// Default host-side round-trip timeout for a single call, covering
/// protocol latency and a sandbox that never replies.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;
