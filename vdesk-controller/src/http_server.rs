//! REST API.
//!
//! JSON endpoints under `/api/v1` for hosts, VMs and private data disks,
//! plus an unauthenticated `/health`. Every API route is gated by the
//! [`AccessGate`] using the principal from the `X-Principal` header.
//! Control-plane errors are returned as `{error, entity, message}` with a
//! status derived from the error kind.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};

use vdesk_hypervisor::{
    AttachmentManager, ConnectionDescriptor, ConnectionRegistry, ControlError, CreateDiskRequest,
    DiskUpdate, ErrorKind, HostRegistration, StorageLifecycleManager, VmConfig, VmLifecycleManager,
};

use crate::access::{AccessGate, Action, Resource};

/// Header carrying the authenticated principal.
pub const PRINCIPAL_HEADER: &str = "x-principal";

/// Shared state for HTTP handlers
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub vms: Arc<VmLifecycleManager>,
    pub storage: Arc<StorageLifecycleManager>,
    pub attachments: Arc<AttachmentManager>,
    pub access: Arc<dyn AccessGate>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    entity: String,
    message: String,
}

/// An error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: &str, entity: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.to_string(),
                entity: entity.to_string(),
                message: message.into(),
            },
        }
    }
}

/// HTTP status for an error kind.
fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationFailed => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidState | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::CapacityExceeded => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::UnsupportedOperation => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let kind = err.kind();
        debug!(kind = %kind, entity = %err.entity(), error = %err, "Request failed");
        ApiError::new(status_for(kind), kind.as_str(), err.entity(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Unwrap a JSON body, reporting malformed input as `ValidationFailed`.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload.map(|Json(value)| value).map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::ValidationFailed.as_str(),
            "request",
            e.body_text(),
        )
    })
}

/// Resolve the principal and check it against the gate.
fn authorize(state: &AppState, headers: &HeaderMap, resource: Resource, action: Action) -> ApiResult<String> {
    let principal = headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized", "principal", "missing X-Principal header"))?;

    if !state.access.can_perform(principal, resource, action) {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "Forbidden",
            principal,
            format!("{} may not perform {}:{}", principal, resource, action),
        ));
    }
    Ok(principal.to_string())
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDisksQuery {
    tenant_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListVmsQuery {
    host_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResizeRequest {
    size_gb: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloneRequest {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachRequest {
    vm_id: String,
    #[serde(default)]
    device: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetachRequest {
    vm_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateVmRequest {
    host_id: String,
    #[serde(flatten)]
    config: VmConfig,
}

#[derive(Debug, Default, Deserialize)]
struct StopVmRequest {
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    storage_backend: &'static str,
}

// ============================================================================
// Server
// ============================================================================

/// Serve the REST API until the shutdown future resolves.
pub async fn run_http_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_app_router(state);

    info!(address = %addr, "Starting REST API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    Ok(())
}

/// Build the application router with all routes
pub fn build_app_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let api_routes = Router::new()
        // Hosts
        .route("/hosts", get(list_hosts).post(register_host))
        .route("/hosts/:host_id", axum::routing::delete(remove_host))
        .route("/hosts/:host_id/connection", put(update_host_connection))
        .route("/hosts/:host_id/test-connection", post(test_host_connection))
        // VMs
        .route("/vms", get(list_vms).post(create_vm))
        .route("/vms/:vm_id", get(get_vm).delete(delete_vm))
        .route("/vms/:vm_id/status", get(get_vm_status))
        .route("/vms/:vm_id/info", get(get_vm_info))
        .route("/vms/:vm_id/start", post(start_vm))
        .route("/vms/:vm_id/stop", post(stop_vm))
        .route("/vms/:vm_id/restart", post(restart_vm))
        // Private data disks
        .route("/private-data-disks", get(list_disks).post(create_disk))
        .route(
            "/private-data-disks/:disk_id",
            get(get_disk).patch(update_disk).delete(delete_disk),
        )
        .route("/private-data-disks/:disk_id/resize", post(resize_disk))
        .route("/private-data-disks/:disk_id/snapshots", get(list_snapshots).post(create_snapshot))
        .route("/private-data-disks/:disk_id/clone", post(clone_disk))
        .route("/private-data-disks/:disk_id/attach", post(attach_disk))
        .route("/private-data-disks/:disk_id/detach", post(detach_disk))
        .route("/private-data-disks/:disk_id/recover-detach", post(recover_detach))
        .route("/private-data-disks/:disk_id/attachments", get(list_attachments));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        storage_backend: state.storage.backend_name(),
    })
}

// ============================================================================
// Hosts
// ============================================================================

/// POST /api/v1/hosts
async fn register_host(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<HostRegistration>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Create)?;
    let registration = json_body(payload)?;
    let host = state.registry.register_host(registration)?;
    Ok((StatusCode::CREATED, Json(host)))
}

/// GET /api/v1/hosts
async fn list_hosts(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Read)?;
    Ok(Json(state.registry.list_hosts()))
}

/// DELETE /api/v1/hosts/:host_id
async fn remove_host(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(host_id): Path<String>,
) -> ApiResult<StatusCode> {
    authorize(&state, &headers, Resource::Compute, Action::Delete)?;
    state.vms.remove_host(&host_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/v1/hosts/:host_id/connection
async fn update_host_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(host_id): Path<String>,
    payload: Result<Json<ConnectionDescriptor>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Update)?;
    let descriptor = json_body(payload)?;
    Ok(Json(state.registry.update_connection(&host_id, descriptor).await?))
}

/// POST /api/v1/hosts/:host_id/test-connection
async fn test_host_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(host_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Manage)?;
    Ok(Json(state.vms.test_host(&host_id).await?))
}

// ============================================================================
// VMs
// ============================================================================

/// POST /api/v1/vms
async fn create_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CreateVmRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Create)?;
    let request = json_body(payload)?;
    let vm = state.vms.create_vm(&request.host_id, request.config).await?;
    Ok((StatusCode::CREATED, Json(vm)))
}

/// GET /api/v1/vms
async fn list_vms(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListVmsQuery>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Read)?;
    Ok(Json(state.vms.list_vms(query.host_id.as_deref())))
}

/// GET /api/v1/vms/:vm_id
async fn get_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Read)?;
    Ok(Json(state.vms.get_vm(&vm_id)?))
}

/// GET /api/v1/vms/:vm_id/status - record reconciled with the backend
async fn get_vm_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Read)?;
    Ok(Json(state.vms.get_vm_status(&vm_id).await?))
}

/// GET /api/v1/vms/:vm_id/info - backend details
async fn get_vm_info(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Read)?;
    Ok(Json(state.vms.get_vm_info(&vm_id).await?))
}

/// POST /api/v1/vms/:vm_id/start
async fn start_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Manage)?;
    Ok(Json(state.vms.start_vm(&vm_id).await?))
}

/// POST /api/v1/vms/:vm_id/stop - graceful unless `{"force": true}`
async fn stop_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    body: Option<Json<StopVmRequest>>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Manage)?;
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    Ok(Json(state.vms.stop_vm(&vm_id, force).await?))
}

/// POST /api/v1/vms/:vm_id/restart
async fn restart_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Manage)?;
    Ok(Json(state.vms.restart_vm(&vm_id).await?))
}

/// DELETE /api/v1/vms/:vm_id
async fn delete_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Compute, Action::Delete)?;
    Ok(Json(state.vms.delete_vm(&vm_id, state.attachments.as_ref()).await?))
}

// ============================================================================
// Private data disks
// ============================================================================

/// POST /api/v1/private-data-disks
async fn create_disk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CreateDiskRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Create)?;
    let request = json_body(payload)?;
    let disk = state.storage.create_disk(request).await?;
    Ok((StatusCode::CREATED, Json(disk)))
}

/// GET /api/v1/private-data-disks?tenantId=
async fn list_disks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListDisksQuery>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Read)?;
    Ok(Json(state.storage.list_disks(query.tenant_id.as_deref())))
}

/// GET /api/v1/private-data-disks/:disk_id
async fn get_disk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(disk_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Read)?;
    Ok(Json(state.storage.get_disk(&disk_id)?))
}

/// PATCH /api/v1/private-data-disks/:disk_id
async fn update_disk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(disk_id): Path<String>,
    payload: Result<Json<DiskUpdate>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Update)?;
    let update = json_body(payload)?;
    Ok(Json(state.storage.update_disk(&disk_id, update).await?))
}

/// DELETE /api/v1/private-data-disks/:disk_id
async fn delete_disk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(disk_id): Path<String>,
) -> ApiResult<StatusCode> {
    authorize(&state, &headers, Resource::Storage, Action::Delete)?;
    state.storage.delete_disk(&disk_id, state.attachments.as_ref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/private-data-disks/:disk_id/resize
async fn resize_disk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(disk_id): Path<String>,
    payload: Result<Json<ResizeRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Update)?;
    let request = json_body(payload)?;
    Ok(Json(state.storage.resize_disk(&disk_id, request.size_gb).await?))
}

/// POST /api/v1/private-data-disks/:disk_id/snapshots
async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(disk_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Manage)?;
    let snapshot = state.storage.snapshot_disk(&disk_id).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// GET /api/v1/private-data-disks/:disk_id/snapshots
async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(disk_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Read)?;
    Ok(Json(state.storage.list_snapshots(&disk_id)?))
}

/// POST /api/v1/private-data-disks/:disk_id/clone
async fn clone_disk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(disk_id): Path<String>,
    body: Option<Json<CloneRequest>>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Create)?;
    let name = body.and_then(|Json(b)| b.name);
    let clone = state.storage.clone_disk(&disk_id, name).await?;
    Ok((StatusCode::CREATED, Json(clone)))
}

/// POST /api/v1/private-data-disks/:disk_id/attach
async fn attach_disk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(disk_id): Path<String>,
    payload: Result<Json<AttachRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Manage)?;
    let request = json_body(payload)?;
    Ok(Json(state.attachments.attach(&disk_id, &request.vm_id, request.device).await?))
}

/// POST /api/v1/private-data-disks/:disk_id/detach
async fn detach_disk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(disk_id): Path<String>,
    payload: Result<Json<DetachRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Manage)?;
    let request = json_body(payload)?;
    Ok(Json(state.attachments.detach(&disk_id, &request.vm_id).await?))
}

/// POST /api/v1/private-data-disks/:disk_id/recover-detach - finish a failed detach
async fn recover_detach(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(disk_id): Path<String>,
    payload: Result<Json<DetachRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Manage)?;
    let request = json_body(payload)?;
    Ok(Json(state.attachments.recover_detach(&disk_id, &request.vm_id).await?))
}

/// GET /api/v1/private-data-disks/:disk_id/attachments
async fn list_attachments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(disk_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, Resource::Storage, Action::Read)?;
    Ok(Json(state.attachments.list_attachments(&disk_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AllowAll, StaticPermissionMatrix};
    use crate::config::AccessConfig;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use vdesk_hypervisor::{
        AttachmentConfig, CredentialStore, Credential, LifecycleConfig, MockFactory,
        MockStorageBackend, RecordTable, RegistryConfig, RetryPolicy, ScriptedExecutor,
        TransportKind,
    };

    fn state(access: Arc<dyn AccessGate>) -> Arc<AppState> {
        let credentials = Arc::new(CredentialStore::new());
        credentials.insert("root", Credential::key("root", "/etc/vdesk/id_ed25519"));
        let registry = Arc::new(ConnectionRegistry::new(
            RecordTable::in_memory("hosts"),
            credentials,
            Arc::new(ScriptedExecutor::new()),
            RegistryConfig::default(),
        ));
        registry
            .register_host(HostRegistration {
                id: Some("host-1".into()),
                virtualization_type: "kvm".into(),
                connection: ConnectionDescriptor::new("10.0.0.5", 22, "root", TransportKind::Ssh),
            })
            .unwrap();

        let vms = Arc::new(VmLifecycleManager::new(
            registry.clone(),
            Arc::new(MockFactory::new()),
            RecordTable::in_memory("vms"),
            LifecycleConfig {
                retry: RetryPolicy::immediate(2),
                provisioning_poll_attempts: 2,
                provisioning_poll_interval_ms: 1,
            },
        ));
        let storage = Arc::new(StorageLifecycleManager::new(
            Arc::new(MockStorageBackend::new()),
            RecordTable::in_memory("disks"),
            RecordTable::in_memory("snapshots"),
            RetryPolicy::immediate(2),
        ));
        let attachments = Arc::new(AttachmentManager::new(
            vms.clone(),
            storage.clone(),
            RecordTable::in_memory("attachments"),
            AttachmentConfig::default(),
        ));
        Arc::new(AppState { registry, vms, storage, attachments, access })
    }

    async fn send(app: &Router, method: &str, uri: &str, principal: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(principal) = principal {
            request = request.header(PRINCIPAL_HEADER, principal);
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_needs_no_principal() {
        let app = build_app_router(state(Arc::new(AllowAll)));
        let (status, body) = send(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storageBackend"], "mock");
    }

    #[tokio::test]
    async fn test_missing_principal_is_unauthorized() {
        let app = build_app_router(state(Arc::new(AllowAll)));
        let (status, body) = send(&app, "GET", "/api/v1/private-data-disks", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");
    }

    #[tokio::test]
    async fn test_denied_action_is_forbidden() {
        let config = AccessConfig {
            enabled: true,
            principals: [("viewer".to_string(), vec!["STORAGE:READ".to_string()])].into_iter().collect(),
        };
        let gate = Arc::new(StaticPermissionMatrix::from_config(&config).unwrap());
        let app = build_app_router(state(gate));

        let (status, _) = send(&app, "GET", "/api/v1/private-data-disks", Some("viewer"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/private-data-disks",
            Some("viewer"),
            Some(json!({"tenantId": "tenant-a", "sizeGb": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Forbidden");
    }

    #[tokio::test]
    async fn test_disk_scenario_over_http() {
        let app = build_app_router(state(Arc::new(AllowAll)));
        let p = Some("operator");

        let (status, v1) = send(&app, "POST", "/api/v1/vms", p, Some(json!({"hostId": "host-1", "name": "desk-01", "cpuCores": 2, "memoryGb": 4, "storageGb": 40}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(v1["state"], "Running");
        let (_, v2) = send(&app, "POST", "/api/v1/vms", p, Some(json!({"hostId": "host-1", "name": "desk-02", "cpuCores": 2, "memoryGb": 4, "storageGb": 40}))).await;
        let (v1, v2) = (v1["id"].as_str().unwrap(), v2["id"].as_str().unwrap());

        let (status, disk) = send(&app, "POST", "/api/v1/private-data-disks", p, Some(json!({"tenantId": "tenant-a", "sizeGb": 50}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let disk_id = disk["id"].as_str().unwrap().to_string();
        let base = format!("/api/v1/private-data-disks/{}", disk_id);

        let (status, resized) = send(&app, "POST", &format!("{}/resize", base), p, Some(json!({"sizeGb": 80}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resized["sizeGb"], 80);

        let (status, body) = send(&app, "POST", &format!("{}/resize", base), p, Some(json!({"sizeGb": 50}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationFailed");
        assert_eq!(body["entity"], disk_id.as_str());

        let (status, _) = send(&app, "POST", &format!("{}/attach", base), p, Some(json!({"vmId": v1}))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, "POST", &format!("{}/attach", base), p, Some(json!({"vmId": v2}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Conflict");

        let (status, _) = send(&app, "POST", &format!("{}/detach", base), p, Some(json!({"vmId": v1}))).await;
        assert_eq!(status, StatusCode::OK);
        let (_, history) = send(&app, "GET", &format!("{}/attachments", base), p, None).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["state"], "Detached");

        let (status, _) = send(&app, "DELETE", &base, p, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, "GET", &base, p, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");
    }

    #[tokio::test]
    async fn test_malformed_body_is_validation_failure() {
        let app = build_app_router(state(Arc::new(AllowAll)));
        let (status, body) = send(&app, "POST", "/api/v1/private-data-disks", Some("operator"), Some(json!({"sizeGb": "large"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationFailed");
    }

    #[tokio::test]
    async fn test_unknown_hypervisor_type_is_not_implemented() {
        let app = build_app_router(state(Arc::new(AllowAll)));
        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/hosts",
            Some("operator"),
            Some(json!({
                "id": "xen-1",
                "virtualizationType": "xen",
                "connection": {"address": "10.0.0.7", "port": 22, "credentialRef": "root", "transport": "ssh"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["entity"], "xen-1");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::CapacityExceeded), StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(status_for(ErrorKind::BackendUnavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::InvalidState), StatusCode::CONFLICT);
    }
}
