//! The reconcile state snapshot.
//!
//! A [`State`] is what the external handler sees: the primary object, its
//! dependents and references grouped by kind key, plus events and requeue
//! hints for the way back. The pre-handler snapshot is kept as the
//! pre-image so that [`State::diff`] can compute the write plan against the
//! handler's output.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

use crate::config::ResourceConfig;
use crate::{Error, Result};

/// Canonical map key for a kind: `lower(kind.version[.group])`, the group
/// omitted for the core API group.
pub fn kind_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}.{}", gvk.kind, gvk.version).to_lowercase()
    } else {
        format!("{}.{}.{}", gvk.kind, gvk.version, gvk.group).to_lowercase()
    }
}

/// Extract the group/version/kind of an object, if it carries type
/// information.
pub fn object_gvk(obj: &DynamicObject) -> Option<GroupVersionKind> {
    let types = obj.types.as_ref()?;
    if types.kind.is_empty() || types.api_version.is_empty() {
        return None;
    }
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Some(GroupVersionKind::gvk(group, version, &types.kind))
}

pub(crate) fn namespace(obj: &DynamicObject) -> String {
    obj.metadata.namespace.clone().unwrap_or_default()
}

pub(crate) fn name(obj: &DynamicObject) -> String {
    obj.metadata.name.clone().unwrap_or_default()
}

pub(crate) fn uid(obj: &DynamicObject) -> String {
    obj.metadata.uid.clone().unwrap_or_default()
}

// Value comparison: DynamicObject carries arbitrary JSON, so equality is
// equality of the serialized tree.
fn objects_equal(a: &DynamicObject, b: &DynamicObject) -> bool {
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

fn same_identity(a: &DynamicObject, b: &DynamicObject) -> bool {
    namespace(a) == namespace(b) && name(a) == name(b)
}

/// A cluster event requested by the handler. Events with an empty type are
/// dropped without being recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEvent {
    /// Event type, conventionally `Normal` or `Warning`; must be non-empty
    #[serde(rename = "type", default)]
    pub event_type: String,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl StateEvent {
    /// Whether the event may be recorded.
    pub fn is_valid(&self) -> bool {
        !self.event_type.is_empty()
    }
}

/// Snapshot of the observed state handed to the handler, and the envelope
/// the handler fills with the desired state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    /// The primary object; the handler returning `null` here requests its
    /// deletion
    #[serde(default)]
    pub object: Option<DynamicObject>,
    /// Dependents grouped by kind key; every declared kind is present even
    /// when empty
    #[serde(default)]
    pub dependents: BTreeMap<String, Vec<DynamicObject>>,
    /// References grouped by kind key; read-only input, never written back
    #[serde(default)]
    pub references: BTreeMap<String, Vec<DynamicObject>>,
    /// Events to record against the primary
    #[serde(default)]
    pub events: Vec<StateEvent>,
    /// Request an immediate requeue
    #[serde(default)]
    pub requeue: bool,
    /// Requeue after this many seconds; zero means no request
    #[serde(default)]
    pub requeue_after: u64,
}

impl State {
    /// Build a snapshot around a primary object.
    pub fn new(
        object: DynamicObject,
        dependents: BTreeMap<String, Vec<DynamicObject>>,
        references: BTreeMap<String, Vec<DynamicObject>>,
    ) -> Self {
        Self {
            object: Some(object),
            dependents,
            references,
            events: Vec::new(),
            requeue: false,
            requeue_after: 0,
        }
    }

    /// Deep copy of the snapshot. Objects own their JSON trees, so a clone
    /// shares nothing with the original.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Whether the handler asked for another reconcile round.
    pub fn requests_requeue(&self) -> bool {
        self.requeue || self.requeue_after > 0
    }

    /// Validate a post-handler snapshot against this pre-image.
    ///
    /// The handler may change anything except the primary's identity, and
    /// its dependents must stay within the declared kinds and the primary's
    /// namespace.
    pub fn validate(&self, new: &State, config: &ResourceConfig) -> Result<()> {
        let pre = self
            .object
            .as_ref()
            .ok_or_else(|| Error::invalid_state("resource: pre-image object is missing"))?;

        if let Some(new_obj) = &new.object {
            if object_gvk(new_obj) != Some(config.gvk()) {
                return Err(Error::invalid_state(
                    "resource: group/version/kind does not match",
                ));
            }
            if namespace(new_obj) != namespace(pre) {
                return Err(Error::invalid_state("resource: namespace does not match"));
            }
            if name(new_obj) != name(pre) {
                return Err(Error::invalid_state("resource: name does not match"));
            }
            if uid(new_obj) != uid(pre) {
                return Err(Error::invalid_state("resource: uid does not match"));
            }
        }

        let declared: BTreeMap<String, GroupVersionKind> = config
            .dependents
            .iter()
            .map(|dep| {
                let gvk = dep.resource.gvk();
                (kind_key(&gvk), gvk)
            })
            .collect();

        for (key, deps) in &new.dependents {
            let declared_gvk = declared.get(key).ok_or_else(|| {
                Error::invalid_state(format!("dependents[{key}]: unexpected group/version/kind"))
            })?;

            for (i, dep) in deps.iter().enumerate() {
                if object_gvk(dep).as_ref() != Some(declared_gvk) {
                    return Err(Error::invalid_state(format!(
                        "dependents[{key}][{i}]: group/version/kind does not match"
                    )));
                }
                if namespace(dep) != namespace(pre) {
                    return Err(Error::invalid_state(format!(
                        "dependents[{key}][{i}]: namespace does not match"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Compute the write plan against a post-handler snapshot, returning
    /// `(created, updated, deleted)` in apply order.
    ///
    /// Dependents are matched by `(namespace, name)` within their kind key;
    /// an update always carries the handler's version. When the handler
    /// drops the primary, only the primary is deleted: the cluster's owner
    /// reference cascade takes the dependents with it.
    pub fn diff(&self, new: &State) -> (Vec<DynamicObject>, Vec<DynamicObject>, Vec<DynamicObject>) {
        let mut created = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();

        let pre = match &self.object {
            Some(pre) => pre,
            None => return (created, updated, deleted),
        };

        let next = match &new.object {
            Some(next) => next,
            None => {
                deleted.push(pre.clone());
                return (created, updated, deleted);
            }
        };

        if same_identity(pre, next) && !objects_equal(pre, next) {
            updated.push(next.clone());
        }

        for (key, old_deps) in &self.dependents {
            let new_deps = new.dependents.get(key).map(Vec::as_slice).unwrap_or(&[]);
            for old_dep in old_deps {
                match new_deps.iter().find(|dep| same_identity(dep, old_dep)) {
                    Some(new_dep) => {
                        if !objects_equal(old_dep, new_dep) {
                            updated.push(new_dep.clone());
                        }
                    }
                    None => deleted.push(old_dep.clone()),
                }
            }
        }

        let primary_namespace = namespace(pre);
        for (key, new_deps) in &new.dependents {
            let old_deps = self.dependents.get(key).map(Vec::as_slice).unwrap_or(&[]);
            for new_dep in new_deps {
                if old_deps.iter().any(|dep| same_identity(dep, new_dep)) {
                    continue;
                }
                let key_matches = object_gvk(new_dep)
                    .map(|gvk| kind_key(&gvk) == *key)
                    .unwrap_or(false);
                // Anything outside the primary's namespace or mislabeled
                // under a foreign kind key is dropped, not created.
                if key_matches && namespace(new_dep) == primary_namespace {
                    created.push(new_dep.clone());
                }
            }
        }

        (created, updated, deleted)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    fn snapshot_with_pods(pods: Vec<DynamicObject>) -> State {
        State::new(
            hello_object("default", "h1"),
            BTreeMap::from([("pod.v1".to_string(), pods)]),
            BTreeMap::new(),
        )
    }

    #[test]
    fn kind_key_omits_empty_group() {
        assert_eq!(kind_key(&GroupVersionKind::gvk("", "v1", "Pod")), "pod.v1");
        assert_eq!(
            kind_key(&GroupVersionKind::gvk("example.com", "v1alpha1", "Hello")),
            "hello.v1alpha1.example.com"
        );
    }

    #[test]
    fn object_gvk_splits_api_version() {
        let pod = pod_object("default", "p1");
        assert_eq!(object_gvk(&pod), Some(GroupVersionKind::gvk("", "v1", "Pod")));

        let hello = hello_object("default", "h1");
        assert_eq!(
            object_gvk(&hello),
            Some(GroupVersionKind::gvk("example.com", "v1alpha1", "Hello"))
        );
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let state = snapshot_with_pods(vec![pod_object("default", "p1")]);
        let (created, updated, deleted) = state.diff(&state.copy());
        assert!(created.is_empty());
        assert!(updated.is_empty());
        assert!(deleted.is_empty());
    }

    #[test]
    fn renamed_dependent_is_delete_plus_create() {
        let state = snapshot_with_pods(vec![pod_object("default", "p1")]);
        let new = snapshot_with_pods(vec![pod_object("default", "p2")]);

        let (created, updated, deleted) = state.diff(&new);
        assert_eq!(created.len(), 1);
        assert!(updated.is_empty());
        assert_eq!(deleted.len(), 1);
        assert_eq!(name(&created[0]), "p2");
        assert_eq!(name(&deleted[0]), "p1");
    }

    #[test]
    fn changed_dependent_takes_the_new_version() {
        let state = snapshot_with_pods(vec![pod_object("default", "p1")]);
        let mut changed = pod_object("default", "p1");
        changed.data = json!({"spec": {"containers": [], "nodeName": "node-1"}});
        let new = snapshot_with_pods(vec![changed]);

        let (created, updated, deleted) = state.diff(&new);
        assert!(created.is_empty());
        assert!(deleted.is_empty());
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].data["spec"]["nodeName"], "node-1");
    }

    #[test]
    fn removed_dependent_is_deleted() {
        let state = snapshot_with_pods(vec![
            pod_object("default", "p1"),
            pod_object("default", "p2"),
        ]);
        let new = snapshot_with_pods(vec![pod_object("default", "p1")]);

        let (created, updated, deleted) = state.diff(&new);
        assert!(created.is_empty());
        assert!(updated.is_empty());
        assert_eq!(deleted.len(), 1);
        assert_eq!(name(&deleted[0]), "p2");
    }

    #[test]
    fn dropped_primary_deletes_only_the_primary() {
        let state = snapshot_with_pods(vec![pod_object("default", "p1")]);
        let mut new = state.copy();
        new.object = None;
        new.dependents.clear();

        let (created, updated, deleted) = state.diff(&new);
        assert!(created.is_empty());
        assert!(updated.is_empty());
        assert_eq!(deleted.len(), 1);
        assert_eq!(name(&deleted[0]), "h1");
        assert_eq!(deleted[0].types.as_ref().unwrap().kind, "Hello");
    }

    #[test]
    fn changed_primary_is_updated() {
        let state = snapshot_with_pods(vec![]);
        let mut new = state.copy();
        new.object.as_mut().unwrap().data["status"] = json!({"phase": "completed"});

        let (created, updated, deleted) = state.diff(&new);
        assert!(created.is_empty());
        assert!(deleted.is_empty());
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].data["status"]["phase"], "completed");
    }

    #[test]
    fn renamed_primary_is_ignored() {
        let state = snapshot_with_pods(vec![]);
        let mut new = state.copy();
        new.object.as_mut().unwrap().metadata.name = Some("other".into());

        let (created, updated, deleted) = state.diff(&new);
        assert!(created.is_empty());
        assert!(updated.is_empty());
        assert!(deleted.is_empty());
    }

    #[test]
    fn cross_namespace_creation_is_dropped() {
        let state = snapshot_with_pods(vec![]);
        let new = snapshot_with_pods(vec![pod_object("other", "p1")]);

        let (created, updated, deleted) = state.diff(&new);
        assert!(created.is_empty());
        assert!(updated.is_empty());
        assert!(deleted.is_empty());
    }

    #[test]
    fn mislabeled_kind_key_is_dropped() {
        let state = snapshot_with_pods(vec![]);
        // A ConfigMap filed under the pod key is never created.
        let stray = object("v1", "ConfigMap", "default", "cm1", "");
        let new = snapshot_with_pods(vec![stray]);

        let (created, _, _) = state.diff(&new);
        assert!(created.is_empty());
    }

    #[test]
    fn copy_isolation() {
        let state = snapshot_with_pods(vec![pod_object("default", "p1")]);
        let before = serde_json::to_value(&state).unwrap();

        let mut copy = state.copy();
        copy.object.as_mut().unwrap().metadata.name = Some("mutated".into());
        copy.dependents.get_mut("pod.v1").unwrap()[0].data["spec"]["nodeName"] =
            json!("mutated-node");
        copy.events.push(StateEvent {
            event_type: "Normal".into(),
            reason: "Mutated".into(),
            message: "copy only".into(),
        });

        assert_eq!(serde_json::to_value(&state).unwrap(), before);
    }

    #[test]
    fn validate_accepts_well_formed_snapshot() {
        let config = hello_resource();
        let state = snapshot_with_pods(vec![]);
        let new = snapshot_with_pods(vec![pod_object("default", "p1")]);
        state.validate(&new, &config).unwrap();
    }

    #[test]
    fn validate_rejects_identity_mutation() {
        let config = hello_resource();
        let state = snapshot_with_pods(vec![]);

        let mut renamed = state.copy();
        renamed.object.as_mut().unwrap().metadata.name = Some("other".into());
        let err = state.validate(&renamed, &config).unwrap_err();
        assert!(err.to_string().contains("name does not match"));

        let mut moved = state.copy();
        moved.object.as_mut().unwrap().metadata.namespace = Some("other".into());
        let err = state.validate(&moved, &config).unwrap_err();
        assert!(err.to_string().contains("namespace does not match"));

        let mut retyped = state.copy();
        retyped.object.as_mut().unwrap().types.as_mut().unwrap().kind = "Goodbye".into();
        let err = state.validate(&retyped, &config).unwrap_err();
        assert!(err.to_string().contains("group/version/kind does not match"));

        let mut reuided = state.copy();
        reuided.object.as_mut().unwrap().metadata.uid = Some("uid-2".into());
        let err = state.validate(&reuided, &config).unwrap_err();
        assert!(err.to_string().contains("uid does not match"));
    }

    #[test]
    fn validate_rejects_undeclared_dependent_kind() {
        let config = hello_resource();
        let state = snapshot_with_pods(vec![]);
        let mut new = state.copy();
        new.dependents.insert(
            "configmap.v1".to_string(),
            vec![object("v1", "ConfigMap", "default", "cm1", "")],
        );

        let err = state.validate(&new, &config).unwrap_err();
        assert!(err.to_string().contains("unexpected group/version/kind"));
    }

    #[test]
    fn validate_rejects_cross_namespace_dependent() {
        let config = hello_resource();
        let state = snapshot_with_pods(vec![]);
        let new = snapshot_with_pods(vec![pod_object("other", "p1")]);

        let err = state.validate(&new, &config).unwrap_err();
        assert!(err
            .to_string()
            .contains("dependents[pod.v1][0]: namespace does not match"));
    }

    #[test]
    fn events_with_empty_type_are_invalid() {
        let valid = StateEvent {
            event_type: "Normal".into(),
            reason: "Created".into(),
            message: "created pod".into(),
        };
        assert!(valid.is_valid());

        let invalid = StateEvent {
            event_type: String::new(),
            reason: "Created".into(),
            message: "created pod".into(),
        };
        assert!(!invalid.is_valid());
    }

    #[test]
    fn state_envelope_uses_wire_names() {
        let mut state = snapshot_with_pods(vec![]);
        state.requeue_after = 30;
        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("requeueAfter").is_some());
        assert!(value.get("object").is_some());
        assert!(value.get("dependents").is_some());
        assert!(value.get("references").is_some());
    }
}
