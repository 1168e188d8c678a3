//! The message protocol between host and sandbox.
//!
//! One [`Message`] enum covers both directions; the `type` tag on the wire
//! selects the variant. Messages are immutable values: once sent they are
//! never mutated, and correlation of replies to requests happens exclusively
//! through `callId`, never through arrival order.
//!
//! Unrecognized `type` tags deserialize into [`Message::Unknown`]; both
//! sides log and drop those rather than crashing.
//!
//! # Wire shape
//!
//! ```
//! use sandbox_core::Message;
//!
//! let msg: Message = serde_json::from_str(
//!     r#"{"type":"loaded","payload":{"id":"subs"}}"#,
//! ).unwrap();
//! assert!(matches!(msg, Message::Loaded { .. }));
//! ```

use crate::error::ErrorInfo;
use crate::types::{CallId, ExtensionId};
use serde::{Deserialize, Serialize};

/// Body of a `load` message: the script source to compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPayload {
    /// Target extension id.
    pub id: ExtensionId,
    /// Plugin source text.
    pub script: String,
}

/// Body of the per-id ack messages (`loaded`, `unloaded`) and of `unload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRef {
    /// The extension id the message refers to.
    pub id: ExtensionId,
}

/// Body of an `unloaded_all` ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadedAllPayload {
    /// Number of exports records evicted.
    pub count: usize,
}

/// Body of a `call` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallPayload {
    /// Extension to invoke.
    pub script_id: ExtensionId,
    /// Exported function name. The protocol is name-agnostic; in practice
    /// this is `getStreams` or `getConfigSchema`.
    pub function_name: String,
    /// Positional arguments, JSON-encoded.
    pub args: Vec<serde_json::Value>,
    /// Sandbox-side execution deadline in milliseconds.
    pub timeout: u64,
}

/// A protocol message. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// host→sandbox: compile and install one script.
    Load {
        /// Script id and source.
        payload: LoadPayload,
    },
    /// sandbox→host: ack of a successful compile.
    Loaded {
        /// The installed id.
        payload: ScriptRef,
    },
    /// sandbox→host: compile or contract failure for one script.
    LoadError {
        /// The failed id.
        payload: ScriptRef,
        /// Stable failure identity.
        error: ErrorInfo,
    },
    /// host→sandbox: evict one script.
    Unload {
        /// The id to evict.
        payload: ScriptRef,
    },
    /// sandbox→host: ack of a single eviction.
    Unloaded {
        /// The evicted id.
        payload: ScriptRef,
    },
    /// host→sandbox: evict every script.
    UnloadAll,
    /// sandbox→host: ack of a full eviction with the count removed.
    UnloadedAll {
        /// How many exports records were dropped.
        payload: UnloadedAllPayload,
    },
    /// host→sandbox: invoke a named function on a loaded script.
    Call {
        /// Correlation id allocated by the host.
        #[serde(rename = "callId")]
        call_id: CallId,
        /// What to invoke and with which deadline.
        payload: CallPayload,
    },
    /// sandbox→host: successful completion; `payload` is the return value.
    #[serde(rename = "result")]
    CallResult {
        /// Correlation id of the completed call.
        #[serde(rename = "callId")]
        call_id: CallId,
        /// The function's return value (JSON; `null` for `undefined`).
        payload: serde_json::Value,
    },
    /// sandbox→host: the call failed; `error` names the reason.
    CallError {
        /// Correlation id of the failed call.
        #[serde(rename = "callId")]
        call_id: CallId,
        /// Stable failure identity.
        error: ErrorInfo,
    },
    /// Any message whose `type` neither side recognizes. Logged and
    /// dropped, never fatal.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Convenience constructor for a `load`.
    #[must_use]
    pub fn load(id: ExtensionId, script: impl Into<String>) -> Self {
        Self::Load {
            payload: LoadPayload {
                id,
                script: script.into(),
            },
        }
    }

    /// Convenience constructor for an `unload`.
    #[must_use]
    pub fn unload(id: ExtensionId) -> Self {
        Self::Unload {
            payload: ScriptRef { id },
        }
    }

    /// Returns `true` for message types the host sends to the sandbox.
    /// The sandbox drops (with a log line) anything else it receives.
    #[must_use]
    pub const fn is_host_to_sandbox(&self) -> bool {
        matches!(
            self,
            Self::Load { .. } | Self::Unload { .. } | Self::UnloadAll | Self::Call { .. }
        )
    }

    /// The wire tag of this message, for log lines.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::Loaded { .. } => "loaded",
            Self::LoadError { .. } => "load_error",
            Self::Unload { .. } => "unload",
            Self::Unloaded { .. } => "unloaded",
            Self::UnloadAll => "unload_all",
            Self::UnloadedAll { .. } => "unloaded_all",
            Self::Call { .. } => "call",
            Self::CallResult { .. } => "result",
            Self::CallError { .. } => "call_error",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_wire_shape() {
        let msg = Message::load(ExtensionId::new("subs"), "function getStreams(){}");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "load",
                "payload": {"id": "subs", "script": "function getStreams(){}"},
            })
        );
    }

    #[test]
    fn call_wire_shape() {
        let msg = Message::Call {
            call_id: CallId::new(3),
            payload: CallPayload {
                script_id: ExtensionId::new("subs"),
                function_name: "getStreams".into(),
                args: vec![json!({"imdb": "tt0111161"})],
                timeout: 30_000,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "call");
        assert_eq!(value["callId"], 3);
        assert_eq!(value["payload"]["scriptId"], "subs");
        assert_eq!(value["payload"]["functionName"], "getStreams");
        assert_eq!(value["payload"]["timeout"], 30_000);
    }

    #[test]
    fn result_and_error_correlate_by_call_id() {
        let ok = Message::CallResult {
            call_id: CallId::new(9),
            payload: json!([1, 2, 3]),
        };
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["type"], "result");
        assert_eq!(value["callId"], 9);

        let err = Message::CallError {
            call_id: CallId::new(9),
            error: ErrorInfo::new("FunctionNotFound", "getConfigSchema"),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "call_error");
        assert_eq!(value["error"]["name"], "FunctionNotFound");
    }

    #[test]
    fn unload_all_is_a_bare_tag() {
        let value = serde_json::to_value(Message::UnloadAll).unwrap();
        assert_eq!(value, json!({"type": "unload_all"}));
    }

    #[test]
    fn unrecognized_type_becomes_unknown() {
        let msg: Message =
            serde_json::from_value(json!({"type": "totally_new", "payload": {}})).unwrap();
        assert_eq!(msg, Message::Unknown);
        assert_eq!(msg.kind(), "unknown");
        assert!(!msg.is_host_to_sandbox());
    }

    #[test]
    fn direction_classification() {
        assert!(Message::UnloadAll.is_host_to_sandbox());
        assert!(Message::load(ExtensionId::new("a"), "x").is_host_to_sandbox());
        let ack = Message::Loaded {
            payload: ScriptRef {
                id: ExtensionId::new("a"),
            },
        };
        assert!(!ack.is_host_to_sandbox());
    }

    #[test]
    fn roundtrip_through_json() {
        let original = Message::Call {
            call_id: CallId::new(77),
            payload: CallPayload {
                script_id: ExtensionId::new("cat"),
                function_name: "getConfigSchema".into(),
                args: vec![],
                timeout: 5_000,
            },
        };
        let text = serde_json::to_string(&original).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, original);
    }
}
