//! Explicit capability table for script contexts.
//!
//! Extension scripts must not be able to open their own transport channels
//! outside the declared `fetch` primitive: no nested script loading, no raw
//! sockets or streaming transports. Rather than temporarily reassigning
//! ambient globals around each call (which races when calls overlap), the
//! denied names are stubbed out once per script context at creation time.
//! The table is scoped to the context, so loading and unloading scripts
//! never touches another script's globals.
//!
//! This is best-effort containment, not a hard security boundary: QuickJS
//! has no ambient DOM or socket APIs to begin with, and the stubs exist so
//! that a plugin probing for them gets a loud, catchable error instead of a
//! silent capability.

use rquickjs::Ctx;

/// Globals that are denied inside every script context.
const DENIED_GLOBALS: &[&str] = &[
    "importScripts",
    "XMLHttpRequest",
    "WebSocket",
    "Worker",
    "SharedWorker",
    "EventSource",
];

/// The set of transport-capable globals stubbed out per script context.
///
/// # Examples
///
/// ```
/// use sandbox_runtime::CapabilityTable;
///
/// let table = CapabilityTable::default();
/// assert!(table.is_denied("WebSocket"));
/// assert!(!table.is_denied("fetch"));
/// ```
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    denied: &'static [&'static str],
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self {
            denied: DENIED_GLOBALS,
        }
    }
}

impl CapabilityTable {
    /// Names stubbed out in every script context.
    #[must_use]
    pub const fn denied(&self) -> &[&str] {
        self.denied
    }

    /// Returns `true` if the named global is on the denied list.
    #[must_use]
    pub fn is_denied(&self, name: &str) -> bool {
        self.denied.contains(&name)
    }

    /// Installs throwing stubs for every denied name into the context's
    /// global scope and freezes them so plugin code cannot swap them back.
    pub(crate) fn install(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let mut script = String::new();
        for name in self.denied {
            script.push_str(&format!(
                "globalThis.{name} = function () {{ \
                   throw new Error(\"{name} is not available in the extension sandbox\"); \
                 }};\n\
                 Object.freeze(globalThis.{name});\n"
            ));
        }
        ctx.eval::<(), _>(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_set_covers_transport_primitives() {
        let table = CapabilityTable::default();
        for name in [
            "importScripts",
            "XMLHttpRequest",
            "WebSocket",
            "Worker",
            "SharedWorker",
            "EventSource",
        ] {
            assert!(table.is_denied(name), "{name} should be denied");
        }
    }

    #[test]
    fn fetch_is_not_denied() {
        assert!(!CapabilityTable::default().is_denied("fetch"));
    }

    #[test]
    fn stubs_throw_inside_a_context() {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();
        context.with(|ctx| {
            CapabilityTable::default().install(&ctx).unwrap();
            let threw: bool = ctx
                .eval(
                    r#"(function () {
                        try { new XMLHttpRequest(); return false; }
                        catch (e) { return e.message.indexOf("not available") !== -1; }
                    })()"#,
                )
                .unwrap();
            assert!(threw);
        });
    }

    #[test]
    fn stubs_are_scoped_to_one_context() {
        let runtime = rquickjs::Runtime::new().unwrap();
        let stubbed = rquickjs::Context::full(&runtime).unwrap();
        let clean = rquickjs::Context::full(&runtime).unwrap();
        stubbed.with(|ctx| CapabilityTable::default().install(&ctx).unwrap());
        clean.with(|ctx| {
            let defined: bool = ctx.eval("typeof WebSocket !== 'undefined'").unwrap();
            assert!(!defined, "stub leaked into a sibling context");
        });
    }
}
