//! Per-resource controller wiring.
//!
//! Each configured resource with a reconciler gets its own controller: a
//! watch on the primary kind, an owner-reference watch on every dependent
//! kind, and an optional resync pulse stream. All of them funnel into one
//! work queue that drives the [`Reconciler`]. Work is keyed by
//! `(namespace, name)`, so reconciles for the same object never overlap
//! while distinct objects proceed in parallel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::runtime::controller::Action;
use kube::runtime::watcher;
use kube::runtime::Controller;
use kube::Client;
use tracing::{debug, error, info};

use crate::client::KubeClusterClient;
use crate::config::ResourceConfig;
use crate::reconciler::Reconciler;
use crate::syncer::Syncer;
use crate::{Error, Result};

/// Shared context handed to every reconcile callback.
pub struct Context {
    reconciler: Reconciler,
}

async fn reconcile(
    obj: Arc<DynamicObject>,
    ctx: Arc<Context>,
) -> std::result::Result<Action, Error> {
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let name = obj.metadata.name.clone().unwrap_or_default();
    ctx.reconciler.reconcile(&namespace, &name).await
}

fn error_policy(obj: Arc<DynamicObject>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        namespace = %obj.metadata.namespace.as_deref().unwrap_or(""),
        name = %obj.metadata.name.as_deref().unwrap_or(""),
        error = %error,
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Build the controller future for one resource. The future runs until the
/// process receives a shutdown signal.
pub fn run_controller(
    config: &ResourceConfig,
    client: Client,
) -> Result<impl Future<Output = ()> + Send> {
    let cluster = Arc::new(KubeClusterClient::new(
        client.clone(),
        &config.controller_name(),
    ));
    let reconciler = Reconciler::new(config, cluster)?;
    let observe = reconciler.is_observer();

    let gvk = config.gvk();
    let resource = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);

    let mut controller = Controller::new_with(api, watcher::Config::default(), resource);

    // Observers only care about the primary; dependents never feed their
    // queue.
    if !observe {
        for dep in &config.dependents {
            let dep_resource = ApiResource::from_gvk(&dep.resource.gvk());
            let dep_api: Api<DynamicObject> = Api::all_with(client.clone(), &dep_resource);
            controller = controller.owns_with(dep_api, dep_resource, watcher::Config::default());
        }
    }

    if let Some(syncer) = Syncer::from_resource(config)? {
        controller = controller.reconcile_all_on(syncer.start());
    }

    let name = config.controller_name();
    let ctx = Arc::new(Context { reconciler });

    Ok(async move {
        info!(controller = %name, "starting controller");
        controller
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(|result| async {
                match result {
                    Ok((obj, action)) => debug!(object = %obj, ?action, "reconciled"),
                    Err(e) => debug!(error = %e, "reconcile dispatch failed"),
                }
            })
            .await;
        info!(controller = %name, "controller stopped");
    })
}
