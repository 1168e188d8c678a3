//! The sandbox instance: engine construction, message loop, and the
//! dedicated thread it all runs on.
//!
//! One `rquickjs::Runtime` serves every script in the sandbox; each script
//! gets its own `Context` (fresh global scope). The loop receives protocol
//! messages from the host over an in-order channel, pumps the QuickJS job
//! queue, and polls in-flight Promises against their deadlines. Because the
//! loop never blocks while calls are in flight, one stuck plugin cannot
//! starve message intake: other calls keep completing on time.
//!
//! Execution deadlines are cooperative. A Promise that never settles is
//! abandoned when its deadline passes; a synchronous runaway section is
//! aborted through the engine's interrupt handler, armed with the earliest
//! active deadline. Neither path force-cancels the plugin function itself;
//! only the host-visible outcome is timed out.

use crate::capabilities::CapabilityTable;
use crate::config::SandboxConfig;
use crate::convert::{js_to_json, json_to_js};
use crate::host_functions::install_fetch;
use crate::store::{ScriptExports, ScriptStore};
use rquickjs::function::Args;
use rquickjs::promise::Promise;
use rquickjs::{CatchResultExt, CaughtError, Context, Persistent, Runtime, Value};
use sandbox_core::protocol::{CallPayload, ScriptRef, UnloadedAllPayload};
use sandbox_core::{CallId, Error, ErrorInfo, ExtensionId, Message};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError, channel};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use uuid::Uuid;

/// How long the loop waits for new messages while work is in flight.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running sandbox thread.
///
/// Dropping the handle closes the host→sandbox channel, which stops the
/// loop and tears the thread down; there is no separate shutdown message.
#[derive(Debug)]
pub struct SandboxHandle {
    tx: Sender<Message>,
    rx: Option<UnboundedReceiver<Message>>,
    instance: Uuid,
}

impl SandboxHandle {
    /// Sends one message to the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the sandbox thread is gone.
    pub fn send(&self, message: Message) -> sandbox_core::Result<()> {
        self.tx.send(message).map_err(|_| Error::ChannelClosed)
    }

    /// Takes the sandbox→host receiver. Yields `Some` exactly once.
    pub fn take_receiver(&mut self) -> Option<UnboundedReceiver<Message>> {
        self.rx.take()
    }

    /// Unique id of this sandbox instance, for log correlation.
    #[must_use]
    pub const fn instance_id(&self) -> Uuid {
        self.instance
    }
}

/// Spawns a sandbox thread and waits for its engine to come up.
///
/// # Errors
///
/// Returns [`Error::SandboxCreation`] when the thread cannot be spawned or
/// the engine (or its HTTP client) fails to construct.
pub fn spawn(config: SandboxConfig) -> sandbox_core::Result<SandboxHandle> {
    let instance = Uuid::new_v4();
    let (host_tx, sandbox_rx) = channel::<Message>();
    let (sandbox_tx, host_rx) = unbounded_channel::<Message>();
    let (ready_tx, ready_rx) = channel::<sandbox_core::Result<()>>();

    let thread_config = config;
    thread::Builder::new()
        .name(format!("extension-sandbox-{instance}"))
        .spawn(move || {
            let sandbox = match SandboxInstance::new(thread_config, instance) {
                Ok(sandbox) => {
                    let _ = ready_tx.send(Ok(()));
                    sandbox
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            sandbox.run(&sandbox_rx, &sandbox_tx);
        })
        .map_err(|e| Error::SandboxCreation {
            reason: format!("failed to spawn sandbox thread: {e}"),
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            tracing::info!(%instance, "sandbox ready");
            Ok(SandboxHandle {
                tx: host_tx,
                rx: Some(host_rx),
                instance,
            })
        }
        Ok(Err(err)) => Err(err),
        Err(_) => Err(Error::SandboxCreation {
            reason: "sandbox thread exited before signalling readiness".into(),
        }),
    }
}

/// Deadline cell shared with the engine's interrupt handler.
///
/// Stores the active deadline as microseconds past a fixed epoch; zero means
/// disarmed. The handler only ever reads, so overlapping arm/disarm from the
/// single loop thread is race-free.
#[derive(Debug, Clone)]
struct InterruptDeadline {
    epoch: Instant,
    deadline_us: Arc<AtomicU64>,
}

impl InterruptDeadline {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            deadline_us: Arc::new(AtomicU64::new(0)),
        }
    }

    fn arm(&self, deadline: Instant) {
        let us = deadline
            .saturating_duration_since(self.epoch)
            .as_micros()
            .min(u128::from(u64::MAX)) as u64;
        self.deadline_us.store(us.max(1), Ordering::Relaxed);
    }

    fn disarm(&self) {
        self.deadline_us.store(0, Ordering::Relaxed);
    }

    fn expired(&self) -> bool {
        let armed = self.deadline_us.load(Ordering::Relaxed);
        armed != 0 && self.epoch.elapsed().as_micros() >= u128::from(armed)
    }
}

/// One call waiting on a plugin Promise.
struct InflightCall {
    call_id: CallId,
    function: String,
    timeout_ms: u64,
    deadline: Instant,
    /// Declared before `context` so the persistent reference is released
    /// while the runtime is still alive; QuickJS aborts on runtime free
    /// if any persistent value outlives it.
    promise: Persistent<Promise<'static>>,
    /// Context captured at call time; a reload of the script does not swap
    /// it out from under this call.
    context: Context,
}

/// How a call settled (or didn't) on one poll.
enum CallOutcome {
    Pending,
    Completed(serde_json::Value),
    Failed(ErrorInfo),
}

/// The sandbox proper: engine, exports table, and in-flight calls. Lives
/// entirely on the sandbox thread.
struct SandboxInstance {
    engine: Runtime,
    scripts: ScriptStore,
    inflight: Vec<InflightCall>,
    interrupt: InterruptDeadline,
    capabilities: CapabilityTable,
    http: Arc<reqwest::blocking::Client>,
    config: SandboxConfig,
    instance: Uuid,
}

impl SandboxInstance {
    fn new(config: SandboxConfig, instance: Uuid) -> sandbox_core::Result<Self> {
        let engine = Runtime::new().map_err(|e| Error::SandboxCreation {
            reason: format!("failed to create JS engine: {e}"),
        })?;
        engine.set_memory_limit(config.memory_limit_bytes());
        engine.set_max_stack_size(config.max_stack_bytes());

        let interrupt = InterruptDeadline::new();
        let handler = interrupt.clone();
        engine.set_interrupt_handler(Some(Box::new(move || handler.expired())));

        let http = reqwest::blocking::Client::builder()
            .timeout(config.fetch_timeout())
            .build()
            .map_err(|e| Error::SandboxCreation {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            engine,
            scripts: ScriptStore::default(),
            inflight: Vec::new(),
            interrupt,
            capabilities: CapabilityTable::default(),
            http: Arc::new(http),
            config,
            instance,
        })
    }

    /// The message loop. Returns when the host closes its sender or stops
    /// reading replies.
    fn run(mut self, rx: &Receiver<Message>, tx: &UnboundedSender<Message>) {
        tracing::debug!(instance = %self.instance, "sandbox loop started");
        'outer: loop {
            // Block only when truly idle; otherwise take what arrived and
            // keep pumping so in-flight calls make progress.
            let idle = self.inflight.is_empty() && !self.engine.is_job_pending();
            let first = if idle {
                match rx.recv() {
                    Ok(message) => Some(message),
                    Err(_) => break,
                }
            } else {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };

            if let Some(message) = first
                && !self.handle_message(message, tx)
            {
                break;
            }
            loop {
                match rx.try_recv() {
                    Ok(message) => {
                        if !self.handle_message(message, tx) {
                            break 'outer;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }

            self.pump_jobs();
            if !self.poll_inflight(tx) {
                break;
            }
        }
        tracing::debug!(
            instance = %self.instance,
            abandoned = self.inflight.len(),
            "sandbox loop stopped"
        );
    }

    /// Applies one host message. Returns `false` when the host has stopped
    /// reading replies and the loop should exit.
    fn handle_message(&mut self, message: Message, tx: &UnboundedSender<Message>) -> bool {
        if !message.is_host_to_sandbox() {
            tracing::warn!(
                instance = %self.instance,
                kind = message.kind(),
                "dropping message not addressed to the sandbox"
            );
            return true;
        }
        match message {
            Message::Load { payload } => {
                let id = payload.id.clone();
                let reply = match self.load_script(&payload.id, &payload.script) {
                    Ok(()) => {
                        tracing::info!(instance = %self.instance, %id, "script loaded");
                        Message::Loaded {
                            payload: ScriptRef { id },
                        }
                    }
                    Err(err) => {
                        tracing::warn!(instance = %self.instance, %id, error = %err, "script load failed");
                        Message::LoadError {
                            error: ErrorInfo::from(&err),
                            payload: ScriptRef { id },
                        }
                    }
                };
                self.send(tx, reply)
            }
            Message::Unload { payload } => {
                if !self.scripts.remove(&payload.id) {
                    tracing::debug!(instance = %self.instance, id = %payload.id, "unload for unknown script");
                }
                self.send(
                    tx,
                    Message::Unloaded {
                        payload: ScriptRef { id: payload.id },
                    },
                )
            }
            Message::UnloadAll => {
                let count = self.scripts.clear();
                tracing::info!(instance = %self.instance, count, "all scripts unloaded");
                self.send(
                    tx,
                    Message::UnloadedAll {
                        payload: UnloadedAllPayload { count },
                    },
                )
            }
            Message::Call { call_id, payload } => self.start_call(call_id, payload, tx),
            // is_host_to_sandbox filtered everything else already.
            _ => true,
        }
    }

    /// Compiles `source` in a fresh context and installs it under `id`.
    /// All-or-nothing: on any failure the new context is dropped and no
    /// partial record is retained.
    fn load_script(&mut self, id: &ExtensionId, source: &str) -> sandbox_core::Result<()> {
        let context = Context::full(&self.engine).map_err(|e| Error::Load {
            id: id.clone(),
            reason: format!("failed to create context: {e}"),
        })?;

        context.with(|ctx| -> sandbox_core::Result<()> {
            self.capabilities
                .install(&ctx)
                .map_err(|e| Error::Load {
                    id: id.clone(),
                    reason: format!("failed to install capability table: {e}"),
                })?;
            install_fetch(&ctx, Arc::clone(&self.http), &self.config).map_err(|e| {
                Error::Load {
                    id: id.clone(),
                    reason: format!("failed to install fetch: {e}"),
                }
            })?;

            if let Err(caught) = ctx.eval::<(), _>(source).catch(&ctx) {
                let info = caught_to_info(&caught);
                return Err(Error::Load {
                    id: id.clone(),
                    reason: format!("{}: {}", info.name, info.message),
                });
            }

            let streams: Value = ctx.globals().get("getStreams").map_err(|e| Error::Load {
                id: id.clone(),
                reason: format!("failed to inspect exports: {e}"),
            })?;
            if !streams.is_function() {
                return Err(Error::Load {
                    id: id.clone(),
                    reason: "script does not export a callable getStreams function".into(),
                });
            }
            Ok(())
        })?;

        let replaced = self.scripts.insert(id.clone(), ScriptExports { context });
        if replaced {
            tracing::debug!(instance = %self.instance, %id, "exports replaced atomically");
        }
        Ok(())
    }

    /// Resolves and invokes the named export. Synchronous returns complete
    /// immediately; a Promise joins the in-flight set with its deadline.
    fn start_call(
        &mut self,
        call_id: CallId,
        payload: CallPayload,
        tx: &UnboundedSender<Message>,
    ) -> bool {
        let Some(exports) = self.scripts.get(&payload.script_id) else {
            let err = Error::ScriptNotLoaded {
                id: payload.script_id,
            };
            return self.send(
                tx,
                Message::CallError {
                    call_id,
                    error: ErrorInfo::from(&err),
                },
            );
        };
        let context = exports.context.clone();
        let timeout_ms = payload.timeout.max(1);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        enum Started {
            Done(CallOutcome),
            InFlight(Persistent<Promise<'static>>),
        }

        self.interrupt.arm(deadline);
        let started = context.with(|ctx| {
            let target: Value = match ctx.globals().get(payload.function_name.as_str()) {
                Ok(value) => value,
                Err(_) => Value::new_undefined(ctx.clone()),
            };
            let Some(function) = target.as_function().cloned() else {
                let err = Error::FunctionNotFound {
                    id: payload.script_id.clone(),
                    function: payload.function_name.clone(),
                };
                return Started::Done(CallOutcome::Failed(ErrorInfo::from(&err)));
            };

            let mut args = Args::new(ctx.clone(), payload.args.len());
            for arg in &payload.args {
                let converted = match json_to_js(&ctx, arg) {
                    Ok(value) => value,
                    Err(e) => {
                        return Started::Done(CallOutcome::Failed(ErrorInfo::new(
                            "InvalidCall",
                            format!("argument conversion failed: {e}"),
                        )));
                    }
                };
                if let Err(e) = args.push_arg(converted) {
                    return Started::Done(CallOutcome::Failed(ErrorInfo::new(
                        "InvalidCall",
                        format!("argument conversion failed: {e}"),
                    )));
                }
            }

            match function.call_arg::<Value>(args).catch(&ctx) {
                Ok(value) => {
                    if let Some(promise) = value.as_promise() {
                        Started::InFlight(Persistent::save(&ctx, promise.clone()))
                    } else {
                        match js_to_json(&value) {
                            Ok(json) => Started::Done(CallOutcome::Completed(json)),
                            Err(e) => Started::Done(CallOutcome::Failed(ErrorInfo::new(
                                "SerializationError",
                                format!("result conversion failed: {e}"),
                            ))),
                        }
                    }
                }
                Err(caught) => Started::Done(CallOutcome::Failed(caught_to_info(&caught))),
            }
        });
        self.interrupt.disarm();

        match started {
            Started::InFlight(promise) => {
                self.inflight.push(InflightCall {
                    call_id,
                    function: payload.function_name,
                    timeout_ms,
                    deadline,
                    context,
                    promise,
                });
                true
            }
            Started::Done(outcome) => {
                let message =
                    self.settle_message(call_id, &payload.function_name, timeout_ms, deadline, outcome);
                self.send(tx, message)
            }
        }
    }

    /// Runs queued engine jobs (Promise reactions) with the interrupt
    /// handler armed at the earliest active deadline, so a runaway
    /// continuation gets aborted too.
    fn pump_jobs(&mut self) {
        if !self.engine.is_job_pending() {
            return;
        }
        if let Some(earliest) = self.inflight.iter().map(|call| call.deadline).min() {
            self.interrupt.arm(earliest);
        }
        loop {
            match self.engine.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => {
                    // The failing job's promise is now rejected; the owning
                    // in-flight call reports it on the next poll.
                    tracing::debug!(instance = %self.instance, "pending job raised");
                }
            }
        }
        self.interrupt.disarm();
    }

    /// Checks every in-flight call: settled Promises are reported, pending
    /// ones past their deadline time out. Returns `false` when the host has
    /// stopped reading replies.
    fn poll_inflight(&mut self, tx: &UnboundedSender<Message>) -> bool {
        if self.inflight.is_empty() {
            return true;
        }
        let now = Instant::now();
        let mut index = 0;
        while index < self.inflight.len() {
            let outcome = Self::check_call(&self.inflight[index], now);
            match outcome {
                CallOutcome::Pending => index += 1,
                settled => {
                    let call = self.inflight.swap_remove(index);
                    let message = self.settle_message(
                        call.call_id,
                        &call.function,
                        call.timeout_ms,
                        call.deadline,
                        settled,
                    );
                    if !self.send(tx, message) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Inspects one in-flight Promise without consuming it.
    fn check_call(call: &InflightCall, now: Instant) -> CallOutcome {
        let settled = call.context.with(|ctx| {
            let promise = match call.promise.clone().restore(&ctx) {
                Ok(promise) => promise,
                Err(e) => {
                    return CallOutcome::Failed(ErrorInfo::new(
                        "InternalError",
                        format!("failed to restore promise: {e}"),
                    ));
                }
            };
            match promise.result::<Value>() {
                None => CallOutcome::Pending,
                Some(Ok(value)) => match js_to_json(&value) {
                    Ok(json) => CallOutcome::Completed(json),
                    Err(e) => CallOutcome::Failed(ErrorInfo::new(
                        "SerializationError",
                        format!("result conversion failed: {e}"),
                    )),
                },
                Some(Err(err)) => {
                    let caught = CaughtError::from_error(&ctx, err);
                    CallOutcome::Failed(caught_to_info(&caught))
                }
            }
        });
        match settled {
            CallOutcome::Pending if now >= call.deadline => {
                // The timer won the race. The plugin function keeps running
                // if it wants to; its eventual result is discarded because
                // this call id is no longer pending anywhere.
                CallOutcome::Failed(ErrorInfo::from(&Error::ExecutionTimeout {
                    function: call.function.clone(),
                    timeout_ms: call.timeout_ms,
                }))
            }
            other => other,
        }
    }

    /// Builds the reply for a settled call, mapping interrupt-induced
    /// failures past the deadline to the timeout error they really are.
    fn settle_message(
        &self,
        call_id: CallId,
        function: &str,
        timeout_ms: u64,
        deadline: Instant,
        outcome: CallOutcome,
    ) -> Message {
        match outcome {
            CallOutcome::Completed(payload) => {
                tracing::debug!(instance = %self.instance, %call_id, function, "call completed");
                Message::CallResult { call_id, payload }
            }
            CallOutcome::Failed(info) => {
                let info = if info.name == "InternalError" && Instant::now() >= deadline {
                    ErrorInfo::from(&Error::ExecutionTimeout {
                        function: function.to_string(),
                        timeout_ms,
                    })
                } else {
                    info
                };
                tracing::debug!(
                    instance = %self.instance,
                    %call_id,
                    function,
                    error = %info.name,
                    "call failed"
                );
                Message::CallError {
                    call_id,
                    error: info,
                }
            }
            CallOutcome::Pending => unreachable!("pending calls are never settled"),
        }
    }

    /// Sends one reply. A closed channel means the host is gone.
    fn send(&self, tx: &UnboundedSender<Message>, message: Message) -> bool {
        if tx.send(message).is_err() {
            tracing::debug!(instance = %self.instance, "host stopped reading; shutting down");
            return false;
        }
        true
    }
}

impl std::fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("instance", &self.instance)
            .field("scripts", &self.scripts.len())
            .field("inflight", &self.inflight.len())
            .finish_non_exhaustive()
    }
}

/// Extracts a stable `{name, message}` from a caught JS error.
fn caught_to_info(caught: &CaughtError<'_>) -> ErrorInfo {
    match caught {
        CaughtError::Exception(exception) => {
            let name = exception
                .get::<_, String>("name")
                .ok()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "Error".to_string());
            let message = exception.message().unwrap_or_default();
            ErrorInfo::new(name, message)
        }
        CaughtError::Value(value) => {
            let rendered = js_to_json(value)
                .ok()
                .map_or_else(|| "unknown thrown value".to_string(), |v| v.to_string());
            ErrorInfo::new("Error", rendered)
        }
        CaughtError::Error(error) => ErrorInfo::new("InternalError", error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_deadline_expiry() {
        let deadline = InterruptDeadline::new();
        assert!(!deadline.expired());

        deadline.arm(Instant::now() - Duration::from_millis(1));
        assert!(deadline.expired());

        deadline.arm(Instant::now() + Duration::from_secs(60));
        assert!(!deadline.expired());

        deadline.disarm();
        assert!(!deadline.expired());
    }

    #[test]
    fn spawn_reports_readiness() {
        let handle = spawn(SandboxConfig::default()).expect("sandbox should start");
        assert!(handle.send(Message::UnloadAll).is_ok());
    }
}
