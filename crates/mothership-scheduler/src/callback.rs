//! HTTP endpoint through which remote reconcilers report operation status.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::api_errors::ApiError;
use crate::invoker::{apply_callback, CallbackMessage, ReconcilerStatus};
use crate::operations::{Operation, OperationsRegistry};

#[derive(Clone)]
pub struct CallbackApiState {
    registry: Arc<dyn OperationsRegistry>,
}

impl CallbackApiState {
    pub fn new(registry: Arc<dyn OperationsRegistry>) -> Self {
        Self { registry }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CallbackRequest {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CallbackResponse {
    pub request_id: String,
    pub data: Operation,
}

pub fn build_router(state: CallbackApiState) -> Router {
    Router::new()
        .route(
            "/v1/operations/:scheduling_id/callback/:correlation_id",
            post(operation_callback),
        )
        .with_state(state)
}

pub async fn operation_callback(
    State(state): State<CallbackApiState>,
    Path((scheduling_id, correlation_id)): Path<(String, String)>,
    body: Result<Json<CallbackRequest>, JsonRejection>,
) -> Result<Json<CallbackResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let status: ReconcilerStatus = req.status.parse().map_err(ApiError::bad_request)?;
    let msg = CallbackMessage::with_error(status, req.error.unwrap_or_default());

    let operation = apply_callback(&*state.registry, &correlation_id, &scheduling_id, &msg)
        .map_err(|e| {
            log::warn!(
                "callback_rejected scheduling_id={} correlation_id={} status={} error={}",
                scheduling_id,
                correlation_id,
                status,
                e
            );
            ApiError::from(e)
        })?;
    log::info!(
        "callback_applied scheduling_id={} correlation_id={} component={} state={}",
        scheduling_id,
        correlation_id,
        operation.component,
        operation.state
    );
    Ok(Json(CallbackResponse {
        request_id: uuid::Uuid::new_v4().to_string(),
        data: operation,
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use super::*;
    use crate::operations::{InMemoryOperationsRegistry, NewOperation, OperationState};

    fn router_with_operation() -> (Router, Arc<InMemoryOperationsRegistry>) {
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        registry
            .register_operation(NewOperation {
                correlation_id: "corr-1",
                scheduling_id: "sched-1",
                component: "istio",
                runtime_id: "rt-1",
                config_version: 1,
            })
            .expect("register");
        let router = build_router(CallbackApiState::new(registry.clone()));
        (router, registry)
    }

    fn callback(scheduling_id: &str, correlation_id: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!(
                "/v1/operations/{}/callback/{}",
                scheduling_id, correlation_id
            ))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn json_body(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn success_marks_operation_done() {
        let (router, registry) = router_with_operation();
        let resp = router
            .oneshot(callback("sched-1", "corr-1", json!({"status": "success"})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["data"]["component"], "istio");

        let op = registry
            .get_operation("corr-1", "sched-1")
            .expect("get")
            .expect("present");
        assert_eq!(op.state, OperationState::Done);
    }

    #[tokio::test]
    async fn error_reason_is_kept() {
        let (router, registry) = router_with_operation();
        let resp = router
            .oneshot(callback(
                "sched-1",
                "corr-1",
                json!({"status": "error", "error": "helm release failed"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let op = registry
            .get_operation("corr-1", "sched-1")
            .expect("get")
            .expect("present");
        assert_eq!(op.state, OperationState::Error);
        assert_eq!(op.reason, "helm release failed");
    }

    #[tokio::test]
    async fn unknown_operation_is_not_found() {
        let (router, _) = router_with_operation();
        let resp = router
            .oneshot(callback("sched-1", "other", json!({"status": "running"})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = json_body(resp).await;
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn unknown_status_and_bad_body_are_rejected() {
        let (router, _) = router_with_operation();
        let resp = router
            .clone()
            .oneshot(callback("sched-1", "corr-1", json!({"status": "exploded"})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router
            .oneshot(callback("sched-1", "corr-1", json!({"error": "no status"})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn final_operation_cannot_change() {
        let (router, _) = router_with_operation();
        let resp = router
            .clone()
            .oneshot(callback("sched-1", "corr-1", json!({"status": "success"})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .oneshot(callback("sched-1", "corr-1", json!({"status": "running"})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
