//! Error taxonomy for the extension sandbox.
//!
//! Every failure a caller can observe is one of these variants, and every
//! failure that crosses the host/sandbox boundary travels as a stable
//! [`ErrorInfo`] `{name, message}` pair. A caller always receives either a
//! resolved value or an error with a stable name; never a silent `undefined`.
//!
//! # Examples
//!
//! ```
//! use sandbox_core::{Error, ExtensionId};
//!
//! let err = Error::ScriptNotLoaded {
//!     id: ExtensionId::new("missing"),
//! };
//! assert!(err.is_script_not_loaded());
//! ```

use crate::types::{CallId, ExtensionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the extension sandbox workspace.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Plugin source failed to compile/evaluate, or the mandatory
    /// `getStreams` export is missing or not callable.
    #[error("failed to load extension '{id}': {reason}")]
    Load {
        /// Extension that failed to load.
        id: ExtensionId,
        /// Compile or contract-violation detail.
        reason: String,
    },

    /// A call targeted an id that is not present in the registry or whose
    /// exports were evicted.
    #[error("extension '{id}' is not loaded")]
    ScriptNotLoaded {
        /// The unregistered or unloaded id.
        id: ExtensionId,
    },

    /// A call arrived while the extension's load ack is still outstanding.
    #[error("extension '{id}' is still loading")]
    ScriptLoading {
        /// The id in `Loading` state.
        id: ExtensionId,
    },

    /// A call targeted an id whose last load failed.
    #[error("extension '{id}' is in error state: {reason}")]
    ScriptErrored {
        /// The errored id.
        id: ExtensionId,
        /// The recorded load failure.
        reason: String,
    },

    /// The named export does not exist on the loaded script or is not
    /// callable. Also covers calling the optional `getConfigSchema` on a
    /// script that never defined it.
    #[error("extension '{id}' has no callable function '{function}'")]
    FunctionNotFound {
        /// Extension the call targeted.
        id: ExtensionId,
        /// The missing function name.
        function: String,
    },

    /// The sandbox-side execution deadline fired before the plugin function
    /// settled. The underlying invocation is never force-cancelled; only the
    /// host-visible outcome is timed out.
    #[error("execution of '{function}' timed out after {timeout_ms}ms")]
    ExecutionTimeout {
        /// Function whose deadline fired.
        function: String,
        /// The configured bound, in milliseconds.
        timeout_ms: u64,
    },

    /// The host-side round-trip deadline fired before any reply arrived.
    /// Distinct from [`Error::ExecutionTimeout`]: this one also covers
    /// protocol latency and a crashed sandbox that never replies.
    #[error("call {call_id} timed out after {timeout_ms}ms without a reply")]
    CallTimeout {
        /// The pending call that was abandoned.
        call_id: CallId,
        /// The configured round-trip bound, in milliseconds.
        timeout_ms: u64,
    },

    /// The sandbox thread or its engine could not be created.
    #[error("failed to create sandbox: {reason}")]
    SandboxCreation {
        /// Engine or thread construction detail.
        reason: String,
    },

    /// The sandbox was torn down (explicitly or fatally) while this call was
    /// in flight.
    #[error("sandbox terminated while call {call_id} was pending")]
    SandboxTerminated {
        /// The rejected pending call.
        call_id: CallId,
    },

    /// Malformed request, e.g. an empty extension id or function name.
    #[error("invalid call: {reason}")]
    InvalidCall {
        /// What was malformed.
        reason: String,
    },

    /// An exception raised by the plugin function itself, passed through
    /// with the exception's own name and message.
    #[error("{name}: {message}")]
    CallFailed {
        /// JS error name (e.g. `TypeError`).
        name: String,
        /// JS error message.
        message: String,
    },

    /// Sending on the sandbox channel failed because the sandbox is gone.
    #[error("sandbox channel is closed")]
    ChannelClosed,
}

impl Error {
    /// Returns `true` for [`Error::Load`].
    #[must_use]
    pub const fn is_load_error(&self) -> bool {
        matches!(self, Self::Load { .. })
    }

    /// Returns `true` for [`Error::ScriptNotLoaded`].
    #[must_use]
    pub const fn is_script_not_loaded(&self) -> bool {
        matches!(self, Self::ScriptNotLoaded { .. })
    }

    /// Returns `true` for [`Error::FunctionNotFound`].
    #[must_use]
    pub const fn is_function_not_found(&self) -> bool {
        matches!(self, Self::FunctionNotFound { .. })
    }

    /// Returns `true` for the sandbox-side deadline.
    #[must_use]
    pub const fn is_execution_timeout(&self) -> bool {
        matches!(self, Self::ExecutionTimeout { .. })
    }

    /// Returns `true` for the host-side round-trip deadline.
    #[must_use]
    pub const fn is_call_timeout(&self) -> bool {
        matches!(self, Self::CallTimeout { .. })
    }

    /// Returns `true` if the error reports sandbox teardown.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, Self::SandboxTerminated { .. })
    }

    /// The stable wire name of this error kind. For plugin-raised
    /// exceptions this is the exception's own name, passed through.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Load { .. } => "LoadError",
            Self::ScriptNotLoaded { .. } => "ScriptNotLoaded",
            Self::ScriptLoading { .. } => "ScriptLoading",
            Self::ScriptErrored { .. } => "ScriptErrored",
            Self::FunctionNotFound { .. } => "FunctionNotFound",
            Self::ExecutionTimeout { .. } => "ExecutionTimeoutError",
            Self::CallTimeout { .. } => "CallTimeoutError",
            Self::SandboxCreation { .. } => "WorkerCreationError",
            Self::SandboxTerminated { .. } => "SandboxTerminated",
            Self::InvalidCall { .. } => "InvalidCall",
            Self::CallFailed { name, .. } => name.as_str(),
            Self::ChannelClosed => "ChannelClosed",
        }
    }
}

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable `{name, message}` pair carried inside `load_error` and
/// `call_error` messages.
///
/// For taxonomy errors `name` is the fixed wire name from [`Error::name`];
/// for plugin-raised exceptions it is the JS error's own name
/// (`TypeError`, `RangeError`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error kind name.
    pub name: String,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorInfo {
    /// Creates an error info from raw parts.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Restores a taxonomy error from the wire form, targeted at the given
    /// extension id. Names the sandbox can emit map back to their variants;
    /// anything else (plugin-defined exception names) becomes
    /// [`Error::CallFailed`].
    #[must_use]
    pub fn into_error(self, id: &ExtensionId) -> Error {
        match self.name.as_str() {
            "LoadError" => Error::Load {
                id: id.clone(),
                reason: self.message,
            },
            "ScriptNotLoaded" => Error::ScriptNotLoaded { id: id.clone() },
            "FunctionNotFound" => {
                // The function name rides in the message; keep it whole.
                Error::FunctionNotFound {
                    id: id.clone(),
                    function: self.message,
                }
            }
            "ExecutionTimeoutError" => {
                let (function, timeout_ms) = parse_execution_timeout(&self.message);
                Error::ExecutionTimeout {
                    function,
                    timeout_ms,
                }
            }
            "InvalidCall" => Error::InvalidCall {
                reason: self.message,
            },
            _ => Error::CallFailed {
                name: self.name,
                message: self.message,
            },
        }
    }
}

/// Recovers the function name and bound from the canonical
/// `ExecutionTimeout` display form. A message in any other shape keeps its
/// text as the function detail with a zero bound.
fn parse_execution_timeout(message: &str) -> (String, u64) {
    let parsed = message
        .strip_prefix("execution of '")
        .and_then(|rest| rest.split_once("' timed out after "))
        .and_then(|(function, tail)| {
            tail.strip_suffix("ms")
                .and_then(|n| n.parse().ok())
                .map(|timeout_ms| (function.to_string(), timeout_ms))
        });
    parsed.unwrap_or_else(|| (message.to_string(), 0))
}

impl From<&Error> for ErrorInfo {
    fn from(err: &Error) -> Self {
        // Plugin exceptions keep their own message; taxonomy errors use the
        // Display form so the message stays self-describing.
        let message = match err {
            Error::CallFailed { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            name: err.name().to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_stable() {
        let cases = [
            (
                Error::Load {
                    id: ExtensionId::new("a"),
                    reason: "bad".into(),
                },
                "LoadError",
            ),
            (
                Error::ScriptNotLoaded {
                    id: ExtensionId::new("a"),
                },
                "ScriptNotLoaded",
            ),
            (
                Error::FunctionNotFound {
                    id: ExtensionId::new("a"),
                    function: "getConfigSchema".into(),
                },
                "FunctionNotFound",
            ),
            (
                Error::ExecutionTimeout {
                    function: "getStreams".into(),
                    timeout_ms: 30_000,
                },
                "ExecutionTimeoutError",
            ),
            (
                Error::SandboxCreation {
                    reason: "engine".into(),
                },
                "WorkerCreationError",
            ),
        ];
        for (err, name) in cases {
            assert_eq!(err.name(), name);
        }
    }

    #[test]
    fn timeout_kinds_are_distinct() {
        let exec = Error::ExecutionTimeout {
            function: "getStreams".into(),
            timeout_ms: 100,
        };
        let call = Error::CallTimeout {
            call_id: CallId::new(1),
            timeout_ms: 100,
        };
        assert!(exec.is_execution_timeout());
        assert!(!exec.is_call_timeout());
        assert!(call.is_call_timeout());
        assert!(!call.is_execution_timeout());
        assert_ne!(exec.name(), call.name());
    }

    #[test]
    fn execution_timeout_message_carries_bound() {
        let err = Error::ExecutionTimeout {
            function: "getStreams".into(),
            timeout_ms: 250,
        };
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn error_info_roundtrip_for_plugin_exception() {
        let info = ErrorInfo::new("TypeError", "x is not a function");
        let err = info.clone().into_error(&ExtensionId::new("a"));
        assert_eq!(
            err,
            Error::CallFailed {
                name: "TypeError".into(),
                message: "x is not a function".into(),
            }
        );
        assert_eq!(info.name, "TypeError");
    }

    #[test]
    fn execution_timeout_round_trips_through_the_wire_form() {
        let original = Error::ExecutionTimeout {
            function: "getStreams".into(),
            timeout_ms: 250,
        };
        let restored = ErrorInfo::from(&original).into_error(&ExtensionId::new("a"));
        assert!(restored.is_execution_timeout());
        assert_eq!(restored, original);
    }

    #[test]
    fn unparseable_timeout_message_keeps_its_text() {
        let info = ErrorInfo::new("ExecutionTimeoutError", "deadline exceeded");
        let err = info.into_error(&ExtensionId::new("a"));
        assert!(err.is_execution_timeout());
        assert_eq!(
            err,
            Error::ExecutionTimeout {
                function: "deadline exceeded".into(),
                timeout_ms: 0,
            }
        );
    }

    #[test]
    fn error_info_restores_invalid_call() {
        let info = ErrorInfo::new("InvalidCall", "argument conversion failed");
        let err = info.into_error(&ExtensionId::new("a"));
        assert_eq!(
            err,
            Error::InvalidCall {
                reason: "argument conversion failed".into(),
            }
        );
    }

    #[test]
    fn error_info_restores_load_error() {
        let info = ErrorInfo::new("LoadError", "getStreams export missing");
        let err = info.into_error(&ExtensionId::new("a"));
        assert!(err.is_load_error());
    }

    #[test]
    fn error_info_serializes_as_name_message() {
        let info = ErrorInfo::new("ScriptNotLoaded", "extension 'a' is not loaded");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "ScriptNotLoaded");
        assert!(json["message"].as_str().unwrap().contains("not loaded"));
    }
}
