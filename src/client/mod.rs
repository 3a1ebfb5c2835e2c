//! Cluster access abstraction.
//!
//! The reconciler and webhook server talk to the cluster through the
//! [`ClusterClient`] trait instead of a concrete API client. Production
//! wiring injects [`KubeClusterClient`]; tests inject a mock. Objects are
//! schemaless [`DynamicObject`]s addressed by group/version/kind, so one
//! client instance serves every configured resource kind.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

#[cfg(test)]
use mockall::automock;

use crate::reconciler::state::{name, namespace, object_gvk, StateEvent};
use crate::{Error, Result};

/// Cluster operations consumed by the framework.
///
/// `get` maps NotFound to `Ok(None)`; every other API failure surfaces as
/// an error so the caller can decide whether to requeue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a namespaced object, or `None` when it does not exist.
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List all objects of a kind in a namespace.
    async fn list(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Vec<DynamicObject>>;

    /// Create an object in its own namespace.
    async fn create(&self, obj: &DynamicObject) -> Result<()>;

    /// Replace an object; the server rejects stale resource versions.
    async fn update(&self, obj: &DynamicObject) -> Result<()>;

    /// Delete an object.
    async fn delete(&self, obj: &DynamicObject) -> Result<()>;

    /// Record a cluster event against an object.
    async fn record_event(&self, obj: &DynamicObject, event: &StateEvent) -> Result<()>;
}

/// [`ClusterClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    reporter: Reporter,
}

impl KubeClusterClient {
    /// Create a client that reports events under the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: std::env::var("HOSTNAME").ok(),
            },
        }
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(gvk);
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }

    fn api_for(&self, obj: &DynamicObject) -> Result<Api<DynamicObject>> {
        let gvk = object_gvk(obj)
            .ok_or_else(|| Error::invalid_state("object has no group/version/kind"))?;
        Ok(self.api(&gvk, &namespace(obj)))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(gvk, namespace).get_opt(name).await?)
    }

    async fn list(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Vec<DynamicObject>> {
        let list = self
            .api(gvk, namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<()> {
        self.api_for(obj)?
            .create(&PostParams::default(), obj)
            .await?;
        Ok(())
    }

    async fn update(&self, obj: &DynamicObject) -> Result<()> {
        self.api_for(obj)?
            .replace(&name(obj), &PostParams::default(), obj)
            .await?;
        Ok(())
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<()> {
        self.api_for(obj)?
            .delete(&name(obj), &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn record_event(&self, obj: &DynamicObject, event: &StateEvent) -> Result<()> {
        let gvk = object_gvk(obj)
            .ok_or_else(|| Error::invalid_state("object has no group/version/kind"))?;
        let resource = ApiResource::from_gvk(&gvk);
        let reference = obj.object_ref(&resource);

        let type_ = if event.event_type == "Normal" {
            EventType::Normal
        } else {
            EventType::Warning
        };

        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: (!event.message.is_empty()).then(|| event.message.clone()),
                    action: event.reason.clone(),
                    secondary: None,
                },
                &reference,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::state::test_support::hello_object;

    #[tokio::test]
    async fn mock_round_trips_an_object() {
        let mut mock = MockClusterClient::new();
        let obj = hello_object("default", "h1");
        let returned = obj.clone();
        mock.expect_get()
            .withf(|gvk, namespace, name| {
                gvk.kind == "Hello" && namespace == "default" && name == "h1"
            })
            .return_once(move |_, _, _| Ok(Some(returned)));

        let got = mock
            .get(
                &GroupVersionKind::gvk("example.com", "v1alpha1", "Hello"),
                "default",
                "h1",
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.metadata.name.as_deref(), Some("h1"));
    }
}
