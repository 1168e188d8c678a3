//! Async host dispatcher for the extension sandbox.
//!
//! [`ExtensionHost`] owns one sandbox instance and everything the caller
//! sees: the extension registry, reconciliation against a desired list, and
//! call routing with correlation ids and deadlines. The sandbox itself runs
//! on its own thread (see `sandbox-runtime`); this crate talks to it purely
//! over the message protocol and never touches plugin code directly.
//!
//! ```no_run
//! use sandbox_core::{ExtensionDefinition, ExtensionId};
//! use sandbox_host::{CallOptions, ExtensionHost};
//! use sandbox_runtime::SandboxConfig;
//!
//! # async fn demo() -> sandbox_core::Result<()> {
//! let host = ExtensionHost::new(SandboxConfig::default())?;
//! host.set_desired_extensions(&[ExtensionDefinition::new(
//!     "subs",
//!     "function getStreams(meta) { return []; }",
//! )])?;
//!
//! let id = ExtensionId::new("subs");
//! host.wait_for_load(&id, std::time::Duration::from_secs(5)).await?;
//! let streams = host
//!     .call_function(&id, "getStreams", vec![], CallOptions::default())
//!     .await?;
//! # let _ = streams;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod registry;

use crate::registry::{ReconcilePlan, ScriptRecord, ScriptState};
use sandbox_core::protocol::CallPayload;
use sandbox_core::{
    CallId, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_EXECUTION_TIMEOUT_MS, Error, ExtensionDefinition,
    ExtensionId, ExtensionStatus, Message,
};
use sandbox_runtime::{SandboxConfig, SandboxHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Per-call deadlines. The execution timeout is enforced inside the sandbox
/// against the plugin function; the call timeout is the host-side bound on
/// the whole round trip and also covers a sandbox that never replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Sandbox-side execution deadline in milliseconds.
    pub execution_timeout_ms: u64,
    /// Host-side round-trip deadline in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            execution_timeout_ms: DEFAULT_EXECUTION_TIMEOUT_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

impl CallOptions {
    /// Overrides the sandbox-side execution deadline.
    #[must_use]
    pub const fn execution_timeout_ms(mut self, ms: u64) -> Self {
        self.execution_timeout_ms = ms;
        self
    }

    /// Overrides the host-side round-trip deadline.
    #[must_use]
    pub const fn call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = ms;
        self
    }
}

/// One call awaiting its reply.
#[derive(Debug)]
struct PendingCall {
    script_id: ExtensionId,
    reply: oneshot::Sender<sandbox_core::Result<serde_json::Value>>,
}

/// Mutable dispatcher state, guarded by one mutex. The lock is held only
/// for map operations and channel sends, never across an await.
#[derive(Debug)]
struct Inner {
    handle: Option<SandboxHandle>,
    scripts: HashMap<ExtensionId, ScriptRecord>,
    pending: HashMap<CallId, PendingCall>,
}

#[derive(Debug)]
struct HostShared {
    state: Mutex<Inner>,
    next_call_id: AtomicU64,
    instance: Uuid,
}

impl HostShared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The host dispatcher: registry, reconciliation, and call routing for one
/// sandbox instance. Cheap to clone; all clones share the same sandbox.
#[derive(Debug, Clone)]
pub struct ExtensionHost {
    shared: Arc<HostShared>,
}

impl ExtensionHost {
    /// Spawns a sandbox and the reply reader task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SandboxCreation`] when the sandbox thread or engine
    /// fails to come up.
    pub fn new(config: SandboxConfig) -> sandbox_core::Result<Self> {
        let mut handle = sandbox_runtime::spawn(config)?;
        let receiver = handle
            .take_receiver()
            .ok_or_else(|| Error::SandboxCreation {
                reason: "sandbox receiver already taken".into(),
            })?;
        let instance = handle.instance_id();
        let shared = Arc::new(HostShared {
            state: Mutex::new(Inner {
                handle: Some(handle),
                scripts: HashMap::new(),
                pending: HashMap::new(),
            }),
            next_call_id: AtomicU64::new(0),
            instance,
        });
        tokio::spawn(run_reader(Arc::clone(&shared), receiver));
        Ok(Self { shared })
    }

    /// Reconciles the registry against `desired`: loads new and changed
    /// scripts, unloads absent ones, and leaves matching ones alone. An
    /// identical desired list is a no-op, so the call is idempotent.
    ///
    /// Loads are asynchronous; the returned plan only says what was sent.
    /// Track completion through [`ExtensionHost::status`] or
    /// [`ExtensionHost::wait_for_load`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCall`] for empty ids, and
    /// [`Error::ChannelClosed`] after termination.
    pub fn set_desired_extensions(
        &self,
        desired: &[ExtensionDefinition],
    ) -> sandbox_core::Result<ReconcilePlan> {
        if desired.iter().any(|d| d.id.is_empty()) {
            return Err(Error::InvalidCall {
                reason: "extension id must not be empty".into(),
            });
        }

        let mut inner = self.shared.lock();
        let plan = registry::plan(&inner.scripts, desired);
        if plan.is_empty() {
            return Ok(plan);
        }
        let Some(handle) = inner.handle.as_ref() else {
            return Err(Error::ChannelClosed);
        };

        for id in &plan.to_unload {
            handle.send(Message::unload(id.clone()))?;
        }
        for definition in &plan.to_load {
            handle.send(Message::load(definition.id.clone(), definition.script.clone()))?;
        }

        // The registry reflects the messages just sent; acks arriving later
        // flip Loading into Loaded or Errored in send order, so the latest
        // load of an id always wins.
        for id in &plan.to_unload {
            inner.scripts.remove(id);
        }
        for definition in &plan.to_load {
            inner
                .scripts
                .insert(definition.id.clone(), ScriptRecord::loading(&definition.script));
        }
        tracing::info!(
            instance = %self.shared.instance,
            loads = plan.to_load.len(),
            unloads = plan.to_unload.len(),
            "reconciliation dispatched"
        );
        Ok(plan)
    }

    /// Current lifecycle status of `id`. Absent ids are `Unregistered`.
    #[must_use]
    pub fn status(&self, id: &ExtensionId) -> ExtensionStatus {
        self.shared
            .lock()
            .scripts
            .get(id)
            .map_or(ExtensionStatus::Unregistered, ScriptRecord::status)
    }

    /// Waits until the load of `id` settles one way or the other.
    ///
    /// # Errors
    ///
    /// [`Error::ScriptNotLoaded`] if the id is unregistered,
    /// [`Error::ScriptErrored`] if the load failed, and
    /// [`Error::ScriptLoading`] if it is still pending when `timeout`
    /// elapses.
    pub async fn wait_for_load(
        &self,
        id: &ExtensionId,
        timeout: Duration,
    ) -> sandbox_core::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.status(id) {
                ExtensionStatus::Loaded => return Ok(()),
                ExtensionStatus::Unregistered => {
                    return Err(Error::ScriptNotLoaded { id: id.clone() });
                }
                ExtensionStatus::Errored(reason) => {
                    return Err(Error::ScriptErrored {
                        id: id.clone(),
                        reason,
                    });
                }
                ExtensionStatus::Loading => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::ScriptLoading { id: id.clone() });
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }
    }

    /// Invokes `function` on the loaded extension `id` and awaits the
    /// correlated reply.
    ///
    /// Fails fast, without a sandbox round trip, when the id is
    /// unregistered, still loading, or errored.
    ///
    /// # Errors
    ///
    /// Besides the fast-fail states: [`Error::CallTimeout`] when no reply
    /// arrives within the round-trip deadline, [`Error::SandboxTerminated`]
    /// when the sandbox goes away mid-call, and whatever error the sandbox
    /// reports for the call itself (timeouts, missing functions, plugin
    /// exceptions).
    pub async fn call_function(
        &self,
        id: &ExtensionId,
        function: &str,
        args: Vec<serde_json::Value>,
        options: CallOptions,
    ) -> sandbox_core::Result<serde_json::Value> {
        if id.is_empty() {
            return Err(Error::InvalidCall {
                reason: "extension id must not be empty".into(),
            });
        }
        if function.is_empty() {
            return Err(Error::InvalidCall {
                reason: "function name must not be empty".into(),
            });
        }

        let call_id = CallId::new(self.shared.next_call_id.fetch_add(1, Ordering::Relaxed) + 1);
        let rx = {
            let mut inner = self.shared.lock();
            match inner.scripts.get(id) {
                None => return Err(Error::ScriptNotLoaded { id: id.clone() }),
                Some(record) => match &record.state {
                    ScriptState::Loading => {
                        return Err(Error::ScriptLoading { id: id.clone() });
                    }
                    ScriptState::Errored(info) => {
                        return Err(Error::ScriptErrored {
                            id: id.clone(),
                            reason: info.message.clone(),
                        });
                    }
                    ScriptState::Loaded => {}
                },
            }
            let Some(handle) = inner.handle.as_ref() else {
                return Err(Error::ChannelClosed);
            };

            let (tx, rx) = oneshot::channel();
            handle.send(Message::Call {
                call_id,
                payload: CallPayload {
                    script_id: id.clone(),
                    function_name: function.to_string(),
                    args,
                    timeout: options.execution_timeout_ms,
                },
            })?;
            inner.pending.insert(
                call_id,
                PendingCall {
                    script_id: id.clone(),
                    reply: tx,
                },
            );
            rx
        };

        tracing::debug!(instance = %self.shared.instance, %call_id, %id, function, "call dispatched");
        match tokio::time::timeout(Duration::from_millis(options.call_timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::SandboxTerminated { call_id }),
            Err(_) => {
                self.shared.lock().pending.remove(&call_id);
                Err(Error::CallTimeout {
                    call_id,
                    timeout_ms: options.call_timeout_ms,
                })
            }
        }
    }

    /// Number of calls currently awaiting a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Tears the sandbox down: closes its channel, rejects every pending
    /// call with [`Error::SandboxTerminated`], and empties the registry.
    /// Safe to call more than once.
    pub fn terminate(&self) {
        let mut inner = self.shared.lock();
        let had_sandbox = inner.handle.take().is_some();
        let rejected = fail_pending(&mut inner);
        inner.scripts.clear();
        if had_sandbox {
            tracing::info!(
                instance = %self.shared.instance,
                rejected,
                "sandbox terminated"
            );
        }
    }
}

/// Rejects every pending call with `SandboxTerminated`. Returns how many
/// were rejected.
fn fail_pending(inner: &mut Inner) -> usize {
    let mut rejected = 0;
    for (call_id, pending) in inner.pending.drain() {
        rejected += 1;
        let _ = pending
            .reply
            .send(Err(Error::SandboxTerminated { call_id }));
    }
    rejected
}

/// Applies sandbox replies to the shared state until the sandbox goes away,
/// then rejects whatever was still pending.
async fn run_reader(shared: Arc<HostShared>, mut receiver: UnboundedReceiver<Message>) {
    while let Some(message) = receiver.recv().await {
        let mut inner = shared.lock();
        match message {
            Message::Loaded { payload } => {
                if let Some(record) = inner.scripts.get_mut(&payload.id) {
                    record.state = ScriptState::Loaded;
                    tracing::info!(instance = %shared.instance, id = %payload.id, "extension loaded");
                } else {
                    // The id was reconciled away while its ack was in
                    // flight; the eviction already went out.
                    tracing::debug!(instance = %shared.instance, id = %payload.id, "ack for evicted id");
                }
            }
            Message::LoadError { payload, error } => {
                tracing::warn!(
                    instance = %shared.instance,
                    id = %payload.id,
                    error = %error.name,
                    message = %error.message,
                    "extension failed to load"
                );
                if let Some(record) = inner.scripts.get_mut(&payload.id) {
                    record.state = ScriptState::Errored(error);
                }
            }
            Message::Unloaded { payload } => {
                tracing::debug!(instance = %shared.instance, id = %payload.id, "extension unloaded");
            }
            Message::UnloadedAll { payload } => {
                tracing::debug!(instance = %shared.instance, count = payload.count, "all extensions unloaded");
            }
            Message::CallResult { call_id, payload } => {
                if let Some(pending) = inner.pending.remove(&call_id) {
                    let _ = pending.reply.send(Ok(payload));
                } else {
                    // The caller gave up on its round-trip deadline.
                    tracing::debug!(instance = %shared.instance, %call_id, "late reply dropped");
                }
            }
            Message::CallError { call_id, error } => {
                if let Some(pending) = inner.pending.remove(&call_id) {
                    let err = error.into_error(&pending.script_id);
                    let _ = pending.reply.send(Err(err));
                } else {
                    tracing::debug!(instance = %shared.instance, %call_id, "late error dropped");
                }
            }
            other => {
                tracing::warn!(
                    instance = %shared.instance,
                    kind = other.kind(),
                    "dropping unexpected message from sandbox"
                );
            }
        }
    }

    // The sandbox is gone; nothing pending can complete anymore and no
    // registered script is reachable.
    let mut inner = shared.lock();
    inner.handle = None;
    inner.scripts.clear();
    let rejected = fail_pending(&mut inner);
    if rejected > 0 {
        tracing::warn!(
            instance = %shared.instance,
            rejected,
            "sandbox channel closed with calls in flight"
        );
    }
}
