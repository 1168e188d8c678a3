//! Extension sandbox built on an embedded QuickJS engine.
//!
//! The sandbox runs on its own OS thread (QuickJS contexts are not `Send`)
//! and is reachable only through the message protocol from `sandbox-core`:
//! the host sends `load`/`unload`/`unload_all`/`call`, the sandbox answers
//! with the matching acks, results, and errors. No memory is shared across
//! the boundary.
//!
//! Each loaded script gets a fresh, isolated evaluation context exposing a
//! single fetch-capable network primitive; a fixed table of transport-capable
//! globals is stubbed out per context. Plugin failures are reported per call
//! and never tear down the sandbox or other scripts' state.

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod capabilities;
pub mod config;
mod convert;
mod host_functions;
mod runtime;
mod store;

pub use capabilities::CapabilityTable;
pub use config::SandboxConfig;
pub use runtime::{SandboxHandle, spawn};
