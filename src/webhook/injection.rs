//! Token-authenticated injection endpoint.
//!
//! Injection lets an out-of-cluster caller create a resource indirectly:
//! the request carries a signed bearer token in the `token` query
//! parameter, the external handler turns the request body into an object,
//! and the framework creates that object in the namespace named by the
//! token. The caller never chooses the namespace.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{error, warn};

use crate::client::ClusterClient;
use crate::handler::typed::{InjectionHandler, InjectionRequest};
use crate::{Error, Result};

/// Claims carried by an injection token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    /// Namespace the injected object is created in; required and non-empty
    #[serde(default)]
    pub namespace: String,
    /// Token name, informational
    #[serde(default)]
    pub name: Option<String>,
    /// Issued-at timestamp, informational
    #[serde(default)]
    pub iat: Option<u64>,
}

/// Verifier for injection tokens, bound to one public key.
///
/// RSA keys verify RS256 signatures, EC keys verify ES256; nothing else is
/// accepted.
pub struct TokenVerifier {
    key: DecodingKey,
    algorithm: Algorithm,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl TokenVerifier {
    /// Load a PEM-encoded public key from disk.
    pub fn load(path: &str) -> Result<Self> {
        let pem = std::fs::read(path)
            .map_err(|e| Error::config(format!("failed to read verification key {path}: {e}")))?;
        Self::from_pem(&pem)
    }

    /// Build a verifier from PEM bytes.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        if let Ok(key) = DecodingKey::from_rsa_pem(pem) {
            return Ok(Self {
                key,
                algorithm: Algorithm::RS256,
            });
        }
        if let Ok(key) = DecodingKey::from_ec_pem(pem) {
            return Ok(Self {
                key,
                algorithm: Algorithm::ES256,
            });
        }
        Err(Error::config("unsupported verification key type"))
    }

    /// Verify a token's signature and claims.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let mut validation = Validation::new(self.algorithm);
        // Tokens are minted with `iat` only; expiry is not part of the
        // contract.
        validation.validate_exp = false;
        validation.required_spec_claims = Default::default();

        let data = jsonwebtoken::decode::<TokenClaims>(token, &self.key, &validation)
            .map_err(|e| Error::token(e.to_string()))?;

        if data.claims.namespace.is_empty() {
            return Err(Error::token("namespace claim must be specified"));
        }

        Ok(data.claims)
    }
}

/// State for one injection endpoint.
pub struct InjectionContext {
    pub(crate) handler: InjectionHandler,
    pub(crate) verifier: TokenVerifier,
    pub(crate) client: Arc<dyn ClusterClient>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

fn header_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        map.entry(name.to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// Injection endpoint. The token is checked before the handler ever runs.
pub(crate) async fn inject(
    State(context): State<Arc<InjectionContext>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(token) = query.token else {
        return (StatusCode::BAD_REQUEST, "token must be specified").into_response();
    };

    let claims = match context.verifier.verify(&token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(error = %e, "rejecting injection request");
            return (StatusCode::BAD_REQUEST, format!("invalid token: {e}")).into_response();
        }
    };

    let request = InjectionRequest {
        headers: header_map(&headers),
        body,
    };

    let response = match context.handler.handle(&request).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "injection handler error");
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("handler error: {e}"))
                .into_response();
        }
    };

    let Some(mut obj) = response.object else {
        return StatusCode::OK.into_response();
    };

    // The token decides where the object lands, not the handler.
    obj.metadata.namespace = Some(claims.namespace.clone());

    match context.client.create(&obj).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => {
            error!(namespace = %claims.namespace, error = %e, "failed to create injected resource");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to create resource: {e}"),
            )
                .into_response()
        }
    }
}
