//! Handler transports.
//!
//! A handler is the external program that decides what the cluster should
//! look like. The framework talks to it through a single operation: a byte
//! slice of request JSON goes in, a byte slice of response JSON comes out.
//! Two transports are provided, a subprocess spawned per invocation and an
//! HTTP endpoint; an in-process variant exists for embedding. The typed
//! facades in [`typed`] choose the JSON envelope for each use case.

mod exec;
mod http;
pub mod typed;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::HandlerConfig;
use crate::{Error, Result};

pub use exec::ExecHandler;
pub use http::HttpHandler;

/// Errors produced by a handler invocation.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler did not finish before its deadline
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// The handler reported failure: non-zero exit status or non-200
    /// response status
    #[error("handler failed: {0}")]
    Failure(String),

    /// The handler finished successfully but produced no output
    #[error("empty response from handler")]
    EmptyResponse,

    /// The handler's output is not valid JSON for the expected envelope
    #[error("invalid handler response: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// I/O failure while talking to the handler
    #[error("transport error: {0}")]
    Transport(String),
}

/// A handler transport: one request in, one response out.
#[async_trait]
pub trait Handler: Send + Sync + std::fmt::Debug {
    /// Invoke the handler with the given request body and return its
    /// response body.
    async fn run(&self, request: &[u8]) -> std::result::Result<Vec<u8>, HandlerError>;
}

/// Build a handler from its configuration.
///
/// Exactly one transport must be set; configuration validation enforces
/// this before the factory runs. The `WHITEBOX_DEBUG` environment variable
/// turns on debug logging for every transport regardless of per-handler
/// flags.
pub fn new_handler(config: &HandlerConfig) -> Result<Arc<dyn Handler>> {
    let env_debug = std::env::var(crate::DEBUG_ENV_VAR)
        .map(|v| !v.is_empty())
        .unwrap_or(false);

    if let Some(in_process) = &config.in_process {
        return Ok(in_process.0.clone());
    }
    if let Some(exec) = &config.exec {
        return Ok(Arc::new(ExecHandler::new(exec, exec.debug || env_debug)?));
    }
    if let Some(http) = &config.http {
        return Ok(Arc::new(HttpHandler::new(http, http.debug || env_debug)?));
    }

    Err(Error::config("no handler specified"))
}

// Debug streams bypass tracing: the contract is a tagged line on the
// process's own stderr, next to whatever the child process writes there.
pub(crate) fn debug_log(transport: &str, stream: &str, msg: &str) {
    eprintln!("[{transport}] {stream}: {msg}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecHandlerConfig;

    #[test]
    fn factory_requires_a_transport() {
        let err = new_handler(&HandlerConfig::default()).unwrap_err();
        assert!(err.to_string().contains("no handler specified"));
    }

    #[test]
    fn factory_prefers_in_process() {
        #[derive(Debug)]
        struct Echo;

        #[async_trait]
        impl Handler for Echo {
            async fn run(&self, request: &[u8]) -> std::result::Result<Vec<u8>, HandlerError> {
                Ok(request.to_vec())
            }
        }

        let mut config = HandlerConfig::in_process(Arc::new(Echo));
        config.exec = Some(ExecHandlerConfig {
            command: "/bin/false".into(),
            ..Default::default()
        });

        let handler = new_handler(&config).unwrap();
        let out = futures::executor::block_on(handler.run(b"ping")).unwrap();
        assert_eq!(out, b"ping");
    }
}
