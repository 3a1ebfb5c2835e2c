//! Component assembly.
//!
//! The manager turns a validated configuration into running components:
//! one controller per resource with a reconciler, and a single webhook
//! server when any resource registers an admission or injection handler.
//! Everything runs until the process receives a shutdown signal.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kube::Client;
use tracing::info;

use crate::client::KubeClusterClient;
use crate::config::Config;
use crate::controller;
use crate::webhook::WebhookServer;
use crate::{Error, Result};

/// Assembled controllers and webhook server, ready to run.
pub struct Manager {
    controllers: Vec<BoxFuture<'static, ()>>,
    webhook: Option<WebhookServer>,
}

impl Manager {
    /// Build every component declared in the configuration.
    pub fn new(config: &Config, client: Client) -> Result<Self> {
        config.validate()?;

        let mut controllers = Vec::new();
        let mut webhook: Option<WebhookServer> = None;

        for resource in &config.resources {
            if resource.reconciler.is_some() {
                controllers.push(controller::run_controller(resource, client.clone())?.boxed());
            }

            if resource.has_webhook() {
                if webhook.is_none() {
                    let server_config = config.webhook.as_ref().ok_or_else(|| {
                        Error::config("webhook: configuration must be specified")
                    })?;
                    webhook = Some(WebhookServer::new(server_config));
                }
                let server = webhook
                    .as_mut()
                    .ok_or_else(|| Error::config("webhook: configuration must be specified"))?;

                if resource.validator.is_some() {
                    server.add_validator(resource)?;
                }
                if resource.mutator.is_some() {
                    server.add_mutator(resource)?;
                }
                if resource.injector.is_some() {
                    let cluster = Arc::new(KubeClusterClient::new(
                        client.clone(),
                        &resource.controller_name(),
                    ));
                    server.add_injector(resource, cluster)?;
                }
            }
        }

        if let Some(metrics) = &config.metrics {
            // Serving metrics belongs to the embedding process.
            info!(port = metrics.port, "metrics endpoint delegated");
        }

        Ok(Self {
            controllers,
            webhook,
        })
    }

    /// Run all components until shutdown. Controller futures stop on the
    /// shutdown signal; the webhook server drains in-flight requests within
    /// its shutdown timeout.
    pub async fn run(self) -> Result<()> {
        let controllers = futures::future::join_all(self.controllers);

        match self.webhook {
            Some(server) => {
                let (webhook_result, _) = tokio::join!(server.serve(), controllers);
                webhook_result
            }
            None => {
                controllers.await;
                Ok(())
            }
        }
    }
}
