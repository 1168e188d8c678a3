//! Host-side extension registry and reconciliation planning.
//!
//! The registry tracks, per extension id, the fingerprint of the script that
//! was last sent to the sandbox and how far its load has progressed.
//! Reconciliation is a pure diff: given the current records and a desired
//! list, [`plan`] says which ids to load and which to unload, and never
//! touches a script whose content is unchanged.

use sandbox_core::{ContentFingerprint, ErrorInfo, ExtensionDefinition, ExtensionId, ExtensionStatus};
use std::collections::HashMap;

/// Load progress of one registered extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptState {
    /// `load` sent, ack not yet received.
    Loading,
    /// The sandbox acked the load.
    Loaded,
    /// The last load failed with this error.
    Errored(ErrorInfo),
}

/// One registry record: the content identity of the script last sent plus
/// its load state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRecord {
    /// Fingerprint of the source text sent to the sandbox.
    pub fingerprint: ContentFingerprint,
    /// Progress of that load.
    pub state: ScriptState,
}

impl ScriptRecord {
    /// A fresh record for a script that was just sent for loading.
    #[must_use]
    pub fn loading(script: &str) -> Self {
        Self {
            fingerprint: ContentFingerprint::of(script),
            state: ScriptState::Loading,
        }
    }

    /// The caller-visible status for this record.
    #[must_use]
    pub fn status(&self) -> ExtensionStatus {
        match &self.state {
            ScriptState::Loading => ExtensionStatus::Loading,
            ScriptState::Loaded => ExtensionStatus::Loaded,
            ScriptState::Errored(info) => ExtensionStatus::Errored(info.message.clone()),
        }
    }
}

/// Output of one reconciliation diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Definitions to (re)load: new ids and ids whose content changed.
    pub to_load: Vec<ExtensionDefinition>,
    /// Ids present in the registry but absent from the desired list.
    pub to_unload: Vec<ExtensionId>,
}

impl ReconcilePlan {
    /// `true` when the desired list matches the registry exactly.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_load.is_empty() && self.to_unload.is_empty()
    }
}

/// Diffs `desired` against `current` by content fingerprint.
///
/// An id is reloaded only when its fingerprint changed or its previous load
/// errored; an identical desired list yields an empty plan, making repeated
/// reconciliation idempotent. Unload order follows registry iteration; load
/// order follows the desired list.
#[must_use]
pub fn plan(
    current: &HashMap<ExtensionId, ScriptRecord>,
    desired: &[ExtensionDefinition],
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    for definition in desired {
        let fingerprint = ContentFingerprint::of(&definition.script);
        let reload = match current.get(&definition.id) {
            None => true,
            // A previously failed load is retried even with identical
            // content, so a transient failure is not sticky forever.
            Some(record) => {
                record.fingerprint != fingerprint
                    || matches!(record.state, ScriptState::Errored(_))
            }
        };
        if reload {
            plan.to_load.push(definition.clone());
        }
    }

    let desired_ids: std::collections::HashSet<&ExtensionId> =
        desired.iter().map(|d| &d.id).collect();
    for id in current.keys() {
        if !desired_ids.contains(id) {
            plan.to_unload.push(id.clone());
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, script: &str) -> ExtensionDefinition {
        ExtensionDefinition::new(id, script)
    }

    fn loaded(script: &str) -> ScriptRecord {
        ScriptRecord {
            fingerprint: ContentFingerprint::of(script),
            state: ScriptState::Loaded,
        }
    }

    #[test]
    fn empty_registry_loads_everything() {
        let current = HashMap::new();
        let plan = plan(&current, &[def("a", "1"), def("b", "2")]);
        assert_eq!(plan.to_load.len(), 2);
        assert!(plan.to_unload.is_empty());
    }

    #[test]
    fn identical_desired_list_is_a_noop() {
        let mut current = HashMap::new();
        current.insert(ExtensionId::new("a"), loaded("1"));
        current.insert(ExtensionId::new("b"), loaded("2"));
        let plan = plan(&current, &[def("a", "1"), def("b", "2")]);
        assert!(plan.is_empty());
    }

    #[test]
    fn changed_content_reloads_only_that_id() {
        let mut current = HashMap::new();
        current.insert(ExtensionId::new("a"), loaded("1"));
        current.insert(ExtensionId::new("b"), loaded("2"));
        let plan = plan(&current, &[def("a", "1"), def("b", "changed")]);
        assert_eq!(plan.to_load, vec![def("b", "changed")]);
        assert!(plan.to_unload.is_empty());
    }

    #[test]
    fn missing_from_desired_unloads() {
        let mut current = HashMap::new();
        current.insert(ExtensionId::new("a"), loaded("1"));
        current.insert(ExtensionId::new("b"), loaded("2"));
        let plan = plan(&current, &[def("a", "1")]);
        assert!(plan.to_load.is_empty());
        assert_eq!(plan.to_unload, vec![ExtensionId::new("b")]);
    }

    #[test]
    fn errored_record_is_retried_with_same_content() {
        let mut current = HashMap::new();
        current.insert(
            ExtensionId::new("a"),
            ScriptRecord {
                fingerprint: ContentFingerprint::of("1"),
                state: ScriptState::Errored(ErrorInfo::new("LoadError", "bad")),
            },
        );
        let plan = plan(&current, &[def("a", "1")]);
        assert_eq!(plan.to_load.len(), 1);
    }

    #[test]
    fn loading_record_with_same_content_is_not_resent() {
        let mut current = HashMap::new();
        current.insert(ExtensionId::new("a"), ScriptRecord::loading("1"));
        let plan = plan(&current, &[def("a", "1")]);
        assert!(plan.is_empty());
    }

    #[test]
    fn record_status_mapping() {
        assert_eq!(ScriptRecord::loading("x").status(), ExtensionStatus::Loading);
        assert_eq!(loaded("x").status(), ExtensionStatus::Loaded);
        let errored = ScriptRecord {
            fingerprint: ContentFingerprint::of("x"),
            state: ScriptState::Errored(ErrorInfo::new("LoadError", "no getStreams")),
        };
        assert_eq!(
            errored.status(),
            ExtensionStatus::Errored("no getStreams".into())
        );
    }
}
