//! The reconcile loop.
//!
//! One [`Reconciler`] exists per configured resource. For every work-queue
//! item it fetches the primary object, gathers its dependents and
//! references, hands the snapshot to the external handler, validates what
//! comes back, performs owner-reference and finalizer bookkeeping, and
//! applies the resulting create/update/delete plan to the cluster.

pub mod fieldpath;
pub mod state;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::core::ApiResource;
use kube::runtime::controller::Action;
use tracing::{debug, info, warn};

use crate::client::ClusterClient;
use crate::config::ResourceConfig;
use crate::handler::typed::StateHandler;
use crate::{Error, Result};

use state::{kind_key, name, namespace, State};

/// Build the owner reference that marks an object as controlled by the
/// given primary.
pub fn controller_reference(primary: &DynamicObject) -> OwnerReference {
    let types = primary.types.clone().unwrap_or_default();
    OwnerReference {
        api_version: types.api_version,
        kind: types.kind,
        name: name(primary),
        uid: state::uid(primary),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Whether a dependent's owner reference points at the given controller
/// reference: apiVersion, kind, name, uid and the controller flag must all
/// match.
pub fn is_controller_reference(candidate: &OwnerReference, owner: &OwnerReference) -> bool {
    candidate.api_version == owner.api_version
        && candidate.kind == owner.kind
        && candidate.name == owner.name
        && candidate.uid == owner.uid
        && candidate.controller == Some(true)
}

fn ensure_finalizer(obj: &mut DynamicObject, finalizer: &str) {
    let finalizers = obj.metadata.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
}

fn remove_finalizer(obj: &mut DynamicObject, finalizer: &str) {
    if let Some(finalizers) = obj.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }
}

fn is_deleting(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// Per-resource reconciler driving an external handler.
pub struct Reconciler {
    config: ResourceConfig,
    client: Arc<dyn ClusterClient>,
    handler: StateHandler,
    finalizer: Option<StateHandler>,
    default_requeue_after: Option<Duration>,
    observe: bool,
}

impl Reconciler {
    /// Build a reconciler for a resource. The resource must carry a
    /// reconciler block; the finalize handler is built from the resource's
    /// own `finalizer` block when present.
    pub fn new(config: &ResourceConfig, client: Arc<dyn ClusterClient>) -> Result<Self> {
        let reconciler = config
            .reconciler
            .as_ref()
            .ok_or_else(|| Error::config("reconciler must be specified"))?;

        let handler = StateHandler::new(&reconciler.handler)?;
        let finalizer = config
            .finalizer
            .as_ref()
            .map(StateHandler::new)
            .transpose()?;

        Ok(Self {
            config: config.clone(),
            client,
            handler,
            finalizer,
            default_requeue_after: reconciler.requeue_after()?,
            observe: reconciler.observe,
        })
    }

    /// Whether this reconciler runs in observe-only mode.
    pub fn is_observer(&self) -> bool {
        self.observe
    }

    /// Run one reconcile for the object at `(namespace, name)`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        if self.observe {
            self.observe(namespace, name).await;
            return Ok(Action::await_change());
        }

        let gvk = self.config.gvk();
        let Some(primary) = self.client.get(&gvk, namespace, name).await? else {
            // Already gone; nothing to reconcile.
            return Ok(Action::await_change());
        };

        let owner_ref = controller_reference(&primary);
        let dependents = self.gather_dependents(&primary, &owner_ref).await?;
        let references = self.gather_references(&primary).await?;

        let state = State::new(primary.clone(), dependents, references);
        let working = state.copy();

        let (mut new_state, finalized) = match &self.finalizer {
            Some(finalizer) if is_deleting(&primary) => {
                info!(namespace, name, "starting finalizer");
                (finalizer.handle(&working).await?, true)
            }
            _ => (self.handler.handle(&working).await?, false),
        };

        state.validate(&new_state, &self.config)?;

        self.set_owner_references(&mut new_state, &owner_ref);

        let finalizer_name = self.config.finalizer_name();
        if finalized && !new_state.requests_requeue() {
            if let Some(obj) = new_state.object.as_mut() {
                remove_finalizer(obj, &finalizer_name);
            }
        } else if self.finalizer.is_some() {
            if let Some(obj) = new_state.object.as_mut() {
                ensure_finalizer(obj, &finalizer_name);
            }
        }

        let (created, updated, deleted) = state.diff(&new_state);

        for obj in &created {
            info!(
                kind = %obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or(""),
                namespace = %state::namespace(obj),
                name = %state::name(obj),
                "creating resource"
            );
            self.client.create(obj).await?;
        }

        for obj in &updated {
            info!(
                kind = %obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or(""),
                namespace = %state::namespace(obj),
                name = %state::name(obj),
                "updating resource"
            );
            self.client.update(obj).await?;
        }

        for obj in &deleted {
            info!(
                kind = %obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or(""),
                namespace = %state::namespace(obj),
                name = %state::name(obj),
                "deleting resource"
            );
            self.client.delete(obj).await?;
        }

        for event in &new_state.events {
            if !event.is_valid() {
                debug!(namespace, name, "dropping event with empty type");
                continue;
            }
            if let Err(e) = self.client.record_event(&primary, event).await {
                warn!(namespace, name, error = %e, "failed to record event");
            }
        }

        Ok(self.action(&new_state))
    }

    // Observe mode: report the object to the handler and ignore everything
    // it says. Errors are logged, never surfaced, so observers cannot stall
    // the queue.
    async fn observe(&self, namespace: &str, name: &str) {
        let gvk = self.config.gvk();

        let mut primary = match self.client.get(&gvk, namespace, name).await {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                let resource = ApiResource::from_gvk(&gvk);
                let mut obj = DynamicObject::new(name, &resource);
                obj.data = serde_json::json!({});
                obj
            }
            Err(e) => {
                warn!(namespace, name, error = %e, "failed to get resource");
                return;
            }
        };

        // Identity is re-set after the get so deleted objects still report
        // who they were.
        primary.metadata.namespace = Some(namespace.to_string());
        primary.metadata.name = Some(name.to_string());

        let state = State::new(primary, BTreeMap::new(), BTreeMap::new());
        if let Err(e) = self.handler.notify(&state).await {
            warn!(namespace, name, error = %e, "handler error");
        }
    }

    async fn gather_dependents(
        &self,
        primary: &DynamicObject,
        owner_ref: &OwnerReference,
    ) -> Result<BTreeMap<String, Vec<DynamicObject>>> {
        let mut dependents = BTreeMap::new();

        for dep in &self.config.dependents {
            let dep_gvk = dep.resource.gvk();
            let key = kind_key(&dep_gvk);

            let items = self.client.list(&dep_gvk, &namespace(primary)).await?;
            let owned = items
                .into_iter()
                .filter(|item| {
                    item.metadata
                        .owner_references
                        .as_deref()
                        .unwrap_or(&[])
                        .iter()
                        .any(|candidate| is_controller_reference(candidate, owner_ref))
                })
                .collect();

            dependents.insert(key, owned);
        }

        Ok(dependents)
    }

    async fn gather_references(
        &self,
        primary: &DynamicObject,
    ) -> Result<BTreeMap<String, Vec<DynamicObject>>> {
        let mut references = BTreeMap::new();

        for reference in &self.config.references {
            if reference.name_field_path.is_empty() {
                continue;
            }

            let ref_gvk = reference.resource.gvk();
            let key = kind_key(&ref_gvk);
            let entry: &mut Vec<DynamicObject> = references.entry(key).or_default();

            for ref_name in fieldpath::extract_names(&reference.name_field_path, primary)? {
                // Dangling references are fine; the handler just sees fewer
                // entries than names.
                if let Some(obj) = self
                    .client
                    .get(&ref_gvk, &namespace(primary), &ref_name)
                    .await?
                {
                    entry.push(obj);
                }
            }
        }

        Ok(references)
    }

    fn set_owner_references(&self, new_state: &mut State, owner_ref: &OwnerReference) {
        let orphaned: HashSet<String> = self
            .config
            .dependents
            .iter()
            .filter(|dep| dep.orphan)
            .map(|dep| kind_key(&dep.resource.gvk()))
            .collect();

        for (key, deps) in new_state.dependents.iter_mut() {
            if orphaned.contains(key) {
                continue;
            }
            for dep in deps {
                dep.metadata.owner_references = Some(vec![owner_ref.clone()]);
            }
        }
    }

    fn action(&self, new_state: &State) -> Action {
        if new_state.requeue_after > 0 {
            Action::requeue(Duration::from_secs(new_state.requeue_after))
        } else if new_state.requeue {
            Action::requeue(Duration::ZERO)
        } else if let Some(after) = self.default_requeue_after {
            Action::requeue(after)
        } else {
            Action::await_change()
        }
    }
}
