//! REST API handlers.
//!
//! Each handler delegates to the kind's `LifecycleManager`. Queries and
//! errors answer with the `{success, data, error}` envelope; successful
//! mutations answer `200` with an empty body.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::warn;

use conduit_core::{ConnectorId, PackageInput};
use conduit_lifecycle::{LifecycleError, LifecycleResult};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for each lifecycle error.
pub fn status_for(e: &LifecycleError) -> StatusCode {
    match e {
        LifecycleError::InvalidRequest(_)
        | LifecycleError::InvalidConfig(_)
        | LifecycleError::AlreadyExists(_)
        | LifecycleError::PackageUnavailable(_) => StatusCode::BAD_REQUEST,
        LifecycleError::Forbidden(_) => StatusCode::FORBIDDEN,
        LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        LifecycleError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn lifecycle_error(e: &LifecycleError) -> Response {
    let status = status_for(e);
    if status.is_server_error() {
        warn!(error = %e, "admin request failed");
    }
    error_response(&e.to_string(), status).into_response()
}

fn empty(result: LifecycleResult<()>) -> Response {
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => lifecycle_error(&e),
    }
}

fn data<T: serde::Serialize>(result: LifecycleResult<T>) -> Response {
    match result {
        Ok(value) => ApiResponse::ok(value).into_response(),
        Err(e) => lifecycle_error(&e),
    }
}

fn parse_instance_id(raw: &str) -> LifecycleResult<u32> {
    raw.parse::<u32>()
        .map_err(|_| LifecycleError::InvalidRequest(format!("invalid instance id: {raw:?}")))
}

// ── Request bodies ─────────────────────────────────────────────

/// Register / update body.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorRequest {
    pub package_url: Option<String>,
    /// Base64-encoded package bytes.
    pub package_data: Option<String>,
    pub config: Option<serde_json::Value>,
}

impl ConnectorRequest {
    fn package_bytes(&self) -> LifecycleResult<Option<Vec<u8>>> {
        self.package_data
            .as_deref()
            .map(|encoded| {
                STANDARD.decode(encoded.trim()).map_err(|e| {
                    LifecycleError::InvalidRequest(format!("package_data is not base64: {e}"))
                })
            })
            .transpose()
    }

    fn package(&self) -> LifecycleResult<PackageInput> {
        Ok(PackageInput::from_parts(
            self.package_bytes()?,
            self.package_url.as_deref(),
        )?)
    }

    fn optional_package(&self) -> LifecycleResult<Option<PackageInput>> {
        Ok(PackageInput::optional_from_parts(
            self.package_bytes()?,
            self.package_url.as_deref(),
        )?)
    }
}

fn body(
    body: Result<Json<ConnectorRequest>, JsonRejection>,
) -> Result<ConnectorRequest, Response> {
    body.map(|Json(req)| req).map_err(|rejection| {
        error_response(&rejection.body_text(), StatusCode::BAD_REQUEST).into_response()
    })
}

// ── Connectors ─────────────────────────────────────────────────

/// POST /{tenant}/{namespace}/{name}
pub async fn register(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): Path<(String, String, String)>,
    req: Result<Json<ConnectorRequest>, JsonRejection>,
) -> Response {
    let req = match body(req) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let id = ConnectorId::new(tenant, namespace, name);
    let package = match req.package() {
        Ok(p) => p,
        Err(e) => return lifecycle_error(&e),
    };
    let config = req
        .config
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    empty(state.manager.register(&id, package, config).await)
}

/// PUT /{tenant}/{namespace}/{name}
pub async fn update(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): Path<(String, String, String)>,
    req: Result<Json<ConnectorRequest>, JsonRejection>,
) -> Response {
    let req = match body(req) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let id = ConnectorId::new(tenant, namespace, name);
    let package = match req.optional_package() {
        Ok(p) => p,
        Err(e) => return lifecycle_error(&e),
    };
    empty(state.manager.update(&id, package, req.config).await)
}

/// DELETE /{tenant}/{namespace}/{name}
pub async fn deregister(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): Path<(String, String, String)>,
) -> Response {
    let id = ConnectorId::new(tenant, namespace, name);
    empty(state.manager.deregister(&id).await)
}

/// GET /{tenant}/{namespace}/{name}
pub async fn get_info(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): Path<(String, String, String)>,
) -> Response {
    let id = ConnectorId::new(tenant, namespace, name);
    data(state.manager.get_info(&id).await)
}

/// GET /{tenant}/{namespace}
pub async fn list_connectors(
    State(state): State<ApiState>,
    Path((tenant, namespace)): Path<(String, String)>,
) -> Response {
    data(state.manager.list(&tenant, &namespace).await)
}

/// GET /builtins
pub async fn list_builtins(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.manager.builtin_connectors()).into_response()
}

// ── Instances ──────────────────────────────────────────────────

/// GET /{tenant}/{namespace}/{name}/status
pub async fn get_status(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): Path<(String, String, String)>,
) -> Response {
    let id = ConnectorId::new(tenant, namespace, name);
    data(state.manager.aggregate_status(&id).await)
}

/// GET /{tenant}/{namespace}/{name}/{instance_id}/status
pub async fn get_instance_status(
    State(state): State<ApiState>,
    Path((tenant, namespace, name, instance_id)): Path<(String, String, String, String)>,
) -> Response {
    let id = ConnectorId::new(tenant, namespace, name);
    let result = match parse_instance_id(&instance_id) {
        Ok(n) => state.manager.instance_status(&id, n).await,
        Err(e) => Err(e),
    };
    data(result)
}

/// POST /{tenant}/{namespace}/{name}/restart
pub async fn restart_all(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): Path<(String, String, String)>,
) -> Response {
    let id = ConnectorId::new(tenant, namespace, name);
    empty(state.manager.restart_all(&id).await)
}

/// POST /{tenant}/{namespace}/{name}/{instance_id}/restart
pub async fn restart_instance(
    State(state): State<ApiState>,
    Path((tenant, namespace, name, instance_id)): Path<(String, String, String, String)>,
) -> Response {
    let id = ConnectorId::new(tenant, namespace, name);
    let result = match parse_instance_id(&instance_id) {
        Ok(n) => state.manager.restart_instance(&id, n).await,
        Err(e) => Err(e),
    };
    empty(result)
}

/// POST /{tenant}/{namespace}/{name}/stop
pub async fn stop_all(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): Path<(String, String, String)>,
) -> Response {
    let id = ConnectorId::new(tenant, namespace, name);
    empty(state.manager.stop_all(&id).await)
}

/// POST /{tenant}/{namespace}/{name}/{instance_id}/stop
pub async fn stop_instance(
    State(state): State<ApiState>,
    Path((tenant, namespace, name, instance_id)): Path<(String, String, String, String)>,
) -> Response {
    let id = ConnectorId::new(tenant, namespace, name);
    let result = match parse_instance_id(&instance_id) {
        Ok(n) => state.manager.stop_instance(&id, n).await,
        Err(e) => Err(e),
    };
    empty(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use conduit_core::{ConnectorCatalog, WorkloadKind};
    use conduit_lifecycle::{LifecycleManager, LifecycleOptions};
    use conduit_state::StateStore;
    use conduit_supervisor::{LocalLauncher, NodePool, RetryPolicy, SupervisorOptions};
    use serde_json::json;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let launcher = Arc::new(LocalLauncher::new(vec!["local".to_string()]));
        let manager = LifecycleManager::new(
            WorkloadKind::Source,
            store,
            Arc::new(ConnectorCatalog::default()),
            launcher,
            Arc::new(NodePool::new(vec!["local".to_string()]).unwrap()),
            LifecycleOptions {
                operation_timeout: Duration::from_secs(5),
                max_parallelism: 8,
                max_package_bytes: 1024 * 1024,
                supervisor: SupervisorOptions {
                    start_retry: RetryPolicy::immediate(1),
                    stop_retry: RetryPolicy::immediate(1),
                },
            },
        );
        ApiState {
            manager: Arc::new(manager),
        }
    }

    fn path(name: &str) -> Path<(String, String, String)> {
        Path(("public".to_string(), "default".to_string(), name.to_string()))
    }

    fn register_body() -> ConnectorRequest {
        ConnectorRequest {
            package_url: None,
            package_data: Some(STANDARD.encode(b"package")),
            config: Some(json!({
                "class_name": "org.example.Source",
                "topic_name": "out",
                "parallelism": 2,
            })),
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn register_and_get_info() {
        let state = test_state();
        let resp = register(State(state.clone()), path("s1"), Ok(Json(register_body()))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.is_empty());

        let resp = get_info(State(state), path("s1")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["config"]["parallelism"], 2);
        assert_eq!(body["data"]["state"], "running");
    }

    #[tokio::test]
    async fn both_package_inputs_are_rejected() {
        let state = test_state();
        let mut req = register_body();
        req.package_url = Some("builtin://datagen".to_string());
        let resp = register(State(state), path("s1"), Ok(Json(req))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("mutually exclusive"));
    }

    #[tokio::test]
    async fn missing_package_is_rejected() {
        let state = test_state();
        let mut req = register_body();
        req.package_data = None;
        let resp = register(State(state), path("s1"), Ok(Json(req))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bad_base64_is_rejected() {
        let state = test_state();
        let mut req = register_body();
        req.package_data = Some("%%% not base64".to_string());
        let resp = register(State(state), path("s1"), Ok(Json(req))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_register_is_bad_request() {
        let state = test_state();
        let resp = register(State(state.clone()), path("s1"), Ok(Json(register_body()))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = register(State(state), path("s1"), Ok(Json(register_body()))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_nonexistent_connector() {
        let state = test_state();
        let resp = get_info(State(state), path("nope")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_numeric_instance_id_is_bad_request() {
        let state = test_state();
        register(State(state.clone()), path("s1"), Ok(Json(register_body()))).await;
        let resp = get_instance_status(
            State(state),
            Path((
                "public".to_string(),
                "default".to_string(),
                "s1".to_string(),
                "first".to_string(),
            )),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_without_changes_is_bad_request() {
        let state = test_state();
        register(State(state.clone()), path("s1"), Ok(Json(register_body()))).await;
        let resp = update(State(state), path("s1"), Ok(Json(ConnectorRequest::default()))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_builtins_empty() {
        let state = test_state();
        let resp = list_builtins(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"], json!([]));
    }

    #[test]
    fn error_status_mapping() {
        let cases = [
            (LifecycleError::InvalidRequest(String::new()), 400),
            (LifecycleError::InvalidConfig(String::new()), 400),
            (LifecycleError::AlreadyExists(String::new()), 400),
            (LifecycleError::PackageUnavailable(String::new()), 400),
            (LifecycleError::Forbidden(String::new()), 403),
            (LifecycleError::NotFound(String::new()), 404),
            (LifecycleError::Timeout(String::new()), 408),
            (LifecycleError::Internal(String::new()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(status_for(&err).as_u16(), code, "{err:?}");
        }
    }
}
