//! Admission validation and mutation endpoints.
//!
//! Both endpoints forward the admission request to an external handler and
//! return its response wrapped back into an admission review. They differ
//! only in how handler failures surface: validation failures become a
//! denial so the API server shows the message, mutation failures become an
//! HTTP 500 so the hook's `failurePolicy` decides.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::warn;

use crate::handler::typed::AdmissionHandler;

fn into_request(
    review: AdmissionReview<DynamicObject>,
) -> Result<AdmissionRequest<DynamicObject>, AdmissionResponse> {
    review.try_into().map_err(|e: kube::core::admission::ConvertAdmissionReviewError| {
        warn!(error = %e, "failed to parse admission request");
        AdmissionResponse::invalid(e.to_string())
    })
}

/// Validation endpoint: handler errors deny the request.
pub(crate) async fn validate(
    State(handler): State<Arc<AdmissionHandler>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request = match into_request(review) {
        Ok(request) => request,
        Err(response) => return Json(response.into_review()),
    };

    let response = match handler.handle(&request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "validation handler error");
            AdmissionResponse::from(&request).deny(format!("handler error: {e}"))
        }
    };

    Json(response.into_review())
}

/// Mutation endpoint: handler errors become HTTP 500.
pub(crate) async fn mutate(
    State(handler): State<Arc<AdmissionHandler>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Response {
    let request = match into_request(review) {
        Ok(request) => request,
        Err(response) => return Json(response.into_review()).into_response(),
    };

    match handler.handle(&request).await {
        Ok(response) => Json(response.into_review()).into_response(),
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "mutation handler error");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("handler error: {e}")).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HandlerConfig, ResourceConfig};
    use crate::handler::{Handler, HandlerError};
    use crate::webhook::WebhookServer;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    #[derive(Debug)]
    struct Fixed(Vec<u8>);

    #[async_trait]
    impl Handler for Fixed {
        async fn run(&self, _request: &[u8]) -> Result<Vec<u8>, HandlerError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Debug)]
    struct Failing;

    #[async_trait]
    impl Handler for Failing {
        async fn run(&self, _request: &[u8]) -> Result<Vec<u8>, HandlerError> {
            Err(HandlerError::Failure("exit status 1: boom".into()))
        }
    }

    fn hello_resource_with(
        validator: Option<HandlerConfig>,
        mutator: Option<HandlerConfig>,
    ) -> ResourceConfig {
        let mut resource: ResourceConfig = serde_yaml::from_str(
            r#"
group: example.com
version: v1alpha1
kind: Hello
"#,
        )
        .unwrap();
        resource.validator = validator;
        resource.mutator = mutator;
        resource
    }

    fn review_body() -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "req-1",
                "kind": {"group": "example.com", "version": "v1alpha1", "kind": "Hello"},
                "resource": {"group": "example.com", "version": "v1alpha1", "resource": "hellos"},
                "operation": "CREATE",
                "userInfo": {},
                "name": "h1",
                "namespace": "default",
                "object": {
                    "apiVersion": "example.com/v1alpha1",
                    "kind": "Hello",
                    "metadata": {"name": "h1", "namespace": "default"},
                    "spec": {"message": "hi"},
                },
            },
        })
    }

    async fn post_review(server: &WebhookServer, path: &str, body: Value) -> (axum::http::StatusCode, Value) {
        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn validation_forwards_the_handler_response() {
        let allowed = br#"{"uid": "req-1", "allowed": true}"#.to_vec();
        let resource = hello_resource_with(
            Some(HandlerConfig::in_process(Arc::new(Fixed(allowed)))),
            None,
        );

        let mut server = WebhookServer::new(&Default::default());
        server.add_validator(&resource).unwrap();

        let (status, body) =
            post_review(&server, "/example.com/v1alpha1/hello/validate", review_body()).await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["response"]["allowed"], json!(true));
        assert_eq!(body["response"]["uid"], json!("req-1"));
    }

    #[tokio::test]
    async fn validation_handler_error_denies() {
        let resource = hello_resource_with(
            Some(HandlerConfig::in_process(Arc::new(Failing))),
            None,
        );

        let mut server = WebhookServer::new(&Default::default());
        server.add_validator(&resource).unwrap();

        let (status, body) =
            post_review(&server, "/example.com/v1alpha1/hello/validate", review_body()).await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["response"]["allowed"], json!(false));
        let message = body["response"]["status"]["message"].as_str().unwrap();
        assert!(message.contains("handler error"), "message: {message}");
    }

    #[tokio::test]
    async fn mutation_handler_error_is_500() {
        let resource = hello_resource_with(
            None,
            Some(HandlerConfig::in_process(Arc::new(Failing))),
        );

        let mut server = WebhookServer::new(&Default::default());
        server.add_mutator(&resource).unwrap();

        let (status, _) =
            post_review(&server, "/example.com/v1alpha1/hello/mutate", review_body()).await;
        assert_eq!(status, axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn malformed_review_is_rejected_not_500() {
        let resource = hello_resource_with(
            Some(HandlerConfig::in_process(Arc::new(Failing))),
            None,
        );

        let mut server = WebhookServer::new(&Default::default());
        server.add_validator(&resource).unwrap();

        // A review without a request section cannot be converted.
        let body = json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"});
        let (status, value) =
            post_review(&server, "/example.com/v1alpha1/hello/validate", body).await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(value["response"]["allowed"], json!(false));
    }
}
