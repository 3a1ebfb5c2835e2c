//! Admission and injection webhook server.
//!
//! One HTTPS server multiplexes every configured webhook by path. Each
//! resource contributes up to three endpoints under its
//! `/{group}/{version}/{lower(kind)}` base path: `validate` and `mutate`
//! forward admission reviews to an external handler, `inject` creates the
//! object a handler returns for a token-authenticated request.

pub mod admission;
pub mod injection;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use kube::core::GroupVersionKind;
use tracing::info;

use crate::client::ClusterClient;
use crate::config::{ResourceConfig, ServerConfig};
use crate::handler::typed::{AdmissionHandler, InjectionHandler};
use crate::{Error, Result};

use injection::{InjectionContext, TokenVerifier};

/// The multiplexed webhook server.
pub struct WebhookServer {
    config: ServerConfig,
    router: Router,
}

impl WebhookServer {
    /// Create a server with no registered hooks.
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            config: config.clone(),
            router: Router::new(),
        }
    }

    fn base_path(gvk: &GroupVersionKind) -> String {
        format!("/{}/{}/{}", gvk.group, gvk.version, gvk.kind.to_lowercase())
    }

    fn mount(&mut self, path: &str, route: axum::routing::MethodRouter) {
        let sub = Router::new().route(path, route);
        self.router = std::mem::take(&mut self.router).merge(sub);
    }

    /// Register the validation endpoint for a resource.
    pub fn add_validator(&mut self, resource: &ResourceConfig) -> Result<()> {
        let config = resource
            .validator
            .as_ref()
            .ok_or_else(|| Error::config("validator must be specified"))?;
        let handler = Arc::new(AdmissionHandler::new(config)?);

        let path = format!("{}/validate", Self::base_path(&resource.gvk()));
        info!(path = %path, "adding validation hook");
        self.mount(&path, post(admission::validate).with_state(handler));
        Ok(())
    }

    /// Register the mutation endpoint for a resource.
    pub fn add_mutator(&mut self, resource: &ResourceConfig) -> Result<()> {
        let config = resource
            .mutator
            .as_ref()
            .ok_or_else(|| Error::config("mutator must be specified"))?;
        let handler = Arc::new(AdmissionHandler::new(config)?);

        let path = format!("{}/mutate", Self::base_path(&resource.gvk()));
        info!(path = %path, "adding mutation hook");
        self.mount(&path, post(admission::mutate).with_state(handler));
        Ok(())
    }

    /// Register the injection endpoint for a resource. Created objects go
    /// through the given cluster client.
    pub fn add_injector(
        &mut self,
        resource: &ResourceConfig,
        client: Arc<dyn ClusterClient>,
    ) -> Result<()> {
        let config = resource
            .injector
            .as_ref()
            .ok_or_else(|| Error::config("injector must be specified"))?;

        let context = Arc::new(InjectionContext {
            handler: InjectionHandler::new(&config.handler)?,
            verifier: TokenVerifier::load(&config.verify_key_file)?,
            client,
        });

        let path = format!("{}/inject", Self::base_path(&resource.gvk()));
        info!(path = %path, "adding injection hook");
        self.mount(&path, post(injection::inject).with_state(context));
        Ok(())
    }

    /// The assembled router, for embedding and tests.
    pub fn router(&self) -> Router {
        self.router
            .clone()
            .layer(middleware::from_fn(log_request))
    }

    /// Serve over TLS until the process receives a shutdown signal, then
    /// drain in-flight requests within the shutdown timeout.
    pub async fn serve(self) -> Result<()> {
        let tls = self
            .config
            .tls
            .as_ref()
            .ok_or_else(|| Error::config("webhook: tls must be specified"))?;

        let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &tls.cert_file,
            &tls.key_file,
        )
        .await
        .map_err(|e| Error::config(format!("webhook: failed to load TLS keypair: {e}")))?;

        let host = if self.config.host.is_empty() {
            "0.0.0.0"
        } else {
            self.config.host.as_str()
        };
        let port = if self.config.port == 0 {
            crate::DEFAULT_WEBHOOK_PORT
        } else {
            self.config.port
        };
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| Error::config(format!("webhook: invalid listen address: {e}")))?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down webhook server");
                shutdown_handle.graceful_shutdown(Some(crate::WEBHOOK_SHUTDOWN_TIMEOUT));
            }
        });

        let app = self.router();
        info!(addr = %addr, "starting webhook server");
        axum_server::bind_rustls(addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .map_err(|e| Error::config(format!("webhook server error: {e}")))
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        path = %path,
        status = %response.status(),
        duration = start.elapsed().as_secs_f64(),
        "webhook request"
    );
    response
}
