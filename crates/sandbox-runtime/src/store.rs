//! Exports table: one isolated context per loaded script.
//!
//! Owned by the sandbox instance, never process-global: a new sandbox starts
//! with an empty table, and dropping the sandbox drops every context. The
//! host only ever learns whether a load succeeded; the contexts themselves
//! never leave this module's owner.

use rquickjs::Context;
use sandbox_core::ExtensionId;
use std::collections::HashMap;

/// The compiled exports of one script: its private evaluation context,
/// whose globals hold `getStreams` and (optionally) `getConfigSchema`.
pub(crate) struct ScriptExports {
    pub context: Context,
}

/// id → exports, with at most one live record per id.
#[derive(Default)]
pub(crate) struct ScriptStore {
    scripts: HashMap<ExtensionId, ScriptExports>,
}

impl ScriptStore {
    /// Installs (or atomically replaces) the exports for `id`. Returns
    /// `true` when a previous record was replaced. Calls already in flight
    /// keep the context they captured at call time.
    pub fn insert(&mut self, id: ExtensionId, exports: ScriptExports) -> bool {
        self.scripts.insert(id, exports).is_some()
    }

    /// Looks up the exports for `id`.
    pub fn get(&self, id: &ExtensionId) -> Option<&ScriptExports> {
        self.scripts.get(id)
    }

    /// Evicts one script. Returns `true` if a record existed.
    pub fn remove(&mut self, id: &ExtensionId) -> bool {
        self.scripts.remove(id).is_some()
    }

    /// Evicts everything, returning how many records were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.scripts.len();
        self.scripts.clear();
        count
    }

    /// Number of loaded scripts.
    pub fn len(&self) -> usize {
        self.scripts.len()
    }
}

impl std::fmt::Debug for ScriptStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptStore")
            .field("len", &self.len())
            .finish()
    }
}
