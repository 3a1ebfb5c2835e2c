//! Typed facades over the handler transports.
//!
//! Each facade pins the JSON envelope for one use case: the state handler
//! exchanges reconcile snapshots, the admission handler exchanges
//! admission-review request/response pairs, and the injection handler
//! exchanges the `{headers, body}` / `{object}` pair. The envelope is the
//! cross-language ABI; unknown fields are tolerated on the way in.

use std::collections::HashMap;
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use serde::{Deserialize, Serialize};

use super::{new_handler, Handler, HandlerError};
use crate::config::HandlerConfig;
use crate::reconciler::state::State;
use crate::Result;

/// Handler facade for reconcile and finalize invocations.
#[derive(Clone)]
pub struct StateHandler {
    inner: Arc<dyn Handler>,
}

impl StateHandler {
    /// Build a state handler from configuration.
    pub fn new(config: &HandlerConfig) -> Result<Self> {
        Ok(Self {
            inner: new_handler(config)?,
        })
    }

    /// Wrap an existing transport.
    pub fn from_handler(handler: Arc<dyn Handler>) -> Self {
        Self { inner: handler }
    }

    /// Send a snapshot to the handler and return the snapshot it produced.
    pub async fn handle(&self, state: &State) -> Result<State> {
        let request = serde_json::to_vec(state)?;
        let response = self.inner.run(&request).await?;
        let new_state = serde_json::from_slice(&response)
            .map_err(|e| crate::Error::Handler(HandlerError::InvalidJson(e)))?;
        Ok(new_state)
    }

    /// Fire-and-forget variant used by observers: the snapshot is sent but
    /// the response is discarded without parsing.
    pub async fn notify(&self, state: &State) -> Result<()> {
        let request = serde_json::to_vec(state)?;
        self.inner.run(&request).await?;
        Ok(())
    }
}

/// Handler facade for admission validation and mutation.
#[derive(Clone)]
pub struct AdmissionHandler {
    inner: Arc<dyn Handler>,
}

impl AdmissionHandler {
    /// Build an admission handler from configuration.
    pub fn new(config: &HandlerConfig) -> Result<Self> {
        Ok(Self {
            inner: new_handler(config)?,
        })
    }

    /// Forward an admission request and return the handler's response.
    pub async fn handle(&self, request: &AdmissionRequest<DynamicObject>) -> Result<AdmissionResponse> {
        let request = serde_json::to_vec(request)?;
        let response = self.inner.run(&request).await?;
        let response = serde_json::from_slice(&response)
            .map_err(|e| crate::Error::Handler(HandlerError::InvalidJson(e)))?;
        Ok(response)
    }
}

/// Request envelope for the injection endpoint: the inbound HTTP request,
/// flattened to headers and body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InjectionRequest {
    /// HTTP request headers
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    /// HTTP request body
    #[serde(default)]
    pub body: String,
}

/// Response envelope for the injection endpoint. A missing object means
/// there is nothing to create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InjectionResponse {
    /// Object to create in the cluster, if any
    #[serde(default)]
    pub object: Option<DynamicObject>,
}

/// Handler facade for injection.
#[derive(Clone)]
pub struct InjectionHandler {
    inner: Arc<dyn Handler>,
}

impl InjectionHandler {
    /// Build an injection handler from configuration.
    pub fn new(config: &HandlerConfig) -> Result<Self> {
        Ok(Self {
            inner: new_handler(config)?,
        })
    }

    /// Forward an injection request and return the handler's response.
    pub async fn handle(&self, request: &InjectionRequest) -> Result<InjectionResponse> {
        let request = serde_json::to_vec(request)?;
        let response = self.inner.run(&request).await?;
        let response = serde_json::from_slice(&response)
            .map_err(|e| crate::Error::Handler(HandlerError::InvalidJson(e)))?;
        Ok(response)
    }
}
