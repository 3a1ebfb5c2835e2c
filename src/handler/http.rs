//! HTTP handler transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;

use super::{debug_log, Handler, HandlerError};
use crate::config::HttpHandlerConfig;
use crate::{Error, Result};

/// Handler that POSTs the request body to a fixed URL.
///
/// The response body must arrive with status 200; anything else fails the
/// invocation. TLS supports an optional client identity (mTLS towards the
/// handler) and an optional CA bundle for verifying the handler.
#[derive(Debug)]
pub struct HttpHandler {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    debug: bool,
}

impl HttpHandler {
    /// Build an HTTP handler from its configuration. Certificate files are
    /// loaded eagerly so a bad path fails at startup.
    pub fn new(config: &HttpHandlerConfig, debug: bool) -> Result<Self> {
        let timeout = config.timeout()?;
        let mut builder = reqwest::Client::builder().use_rustls_tls().timeout(timeout);

        if let Some(tls) = &config.tls {
            if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
                let mut pem = std::fs::read(cert_file).map_err(|e| {
                    Error::config(format!("failed to read cert file {cert_file}: {e}"))
                })?;
                pem.extend(std::fs::read(key_file).map_err(|e| {
                    Error::config(format!("failed to read key file {key_file}: {e}"))
                })?);
                let identity = reqwest::Identity::from_pem(&pem)
                    .map_err(|e| Error::config(format!("invalid client identity: {e}")))?;
                builder = builder.identity(identity);
            }

            if let Some(ca_file) = &tls.ca_cert_file {
                let buf = std::fs::read(ca_file).map_err(|e| {
                    Error::config(format!("failed to read CA cert file {ca_file}: {e}"))
                })?;
                let ca = reqwest::Certificate::from_pem(&buf)
                    .map_err(|e| Error::config(format!("invalid CA certificate: {e}")))?;
                builder = builder.add_root_certificate(ca);
            }
        }

        let client = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            timeout,
            debug,
        })
    }
}

#[async_trait]
impl Handler for HttpHandler {
    async fn run(&self, request: &[u8]) -> std::result::Result<Vec<u8>, HandlerError> {
        if self.debug {
            debug_log("http", "request", &String::from_utf8_lossy(request));
        }

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(request.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HandlerError::Timeout(self.timeout)
                } else {
                    HandlerError::Transport(e.to_string())
                }
            })?;

        if response.status() != StatusCode::OK {
            return Err(HandlerError::Failure(format!(
                "invalid status: {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| HandlerError::Transport(e.to_string()))?;

        if self.debug {
            debug_log("http", "response", &String::from_utf8_lossy(&body));
        }

        if body.is_empty() {
            return Err(HandlerError::EmptyResponse);
        }

        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_tls() {
        let config = HttpHandlerConfig {
            url: "https://handlers.svc/reconcile".into(),
            ..Default::default()
        };
        let handler = HttpHandler::new(&config, false).unwrap();
        assert_eq!(handler.timeout, crate::DEFAULT_HANDLER_TIMEOUT);
        assert_eq!(handler.url, "https://handlers.svc/reconcile");
    }

    #[test]
    fn missing_cert_file_fails_at_startup() {
        let config = HttpHandlerConfig {
            url: "https://handlers.svc/reconcile".into(),
            tls: Some(crate::config::HandlerTlsConfig {
                cert_file: Some("/nonexistent/tls.crt".into()),
                key_file: Some("/nonexistent/tls.key".into()),
                ca_cert_file: None,
            }),
            ..Default::default()
        };
        let err = HttpHandler::new(&config, false).unwrap_err();
        assert!(err.to_string().contains("failed to read cert file"));
    }
}
