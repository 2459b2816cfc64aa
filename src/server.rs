//! Control-Plane API
//!
//! REST surface for ingestion, sessions, devices, discovery, health,
//! telemetry and ledger verification. Permission checks run before any
//! component call; denials are themselves ledger events. While any
//! ledger shard is in integrity lockdown every mutating endpoint
//! answers 503.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{AuthRegistry, Permission, Principal};
use crate::chunk::{ChannelInfo, DataType, SampleChunk};
use crate::config::EngineConfig;
use crate::discovery::DiscoveryOptions;
use crate::error::EngineError;
use crate::ingest::{BatchStore, IngestionService};
use crate::ledger::{EventType, LedgerHandle, LedgerIntent, LedgerStore, VerifyOutcome};
use crate::manager::DeviceManager;
use crate::pipeline::ProcessingPipeline;
use crate::session::SessionStore;
use crate::util::now_ns;

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub auth: Arc<AuthRegistry>,
    pub manager: Arc<DeviceManager>,
    pub ingestion: Arc<IngestionService>,
    pub pipeline: Arc<ProcessingPipeline>,
    pub ledger: LedgerHandle,
    pub ledger_store: LedgerStore,
    pub sessions: SessionStore,
    pub batches: BatchStore,
}

// ============================================================================
// Error mapping
// ============================================================================

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::Validation { .. } | EngineError::Codec(_) => StatusCode::BAD_REQUEST,
            EngineError::Permission { .. } => StatusCode::FORBIDDEN,
            EngineError::SessionNotFound { .. } | EngineError::DeviceNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            EngineError::SessionConflict { .. } => StatusCode::CONFLICT,
            EngineError::Resource { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::Integrity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Device(_) => StatusCode::BAD_GATEWAY,
            EngineError::Transient { .. } | EngineError::Configuration { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError {
            status,
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "code": self.code,
                "error": self.message,
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Auth helpers
// ============================================================================

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    permission: Permission,
) -> ApiResult<Principal> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    let principal = match state.auth.authenticate(header) {
        Some(principal) => principal,
        None => {
            return Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "ErrUnauthenticated",
                "missing or invalid bearer token",
            ))
        }
    };
    if !principal.has(permission) {
        let intent = LedgerIntent::new(EventType::AccessDenied).metadata(serde_json::json!({
            "principal": principal.name,
            "permission": permission.as_str(),
        }));
        state.ledger.record_nowait(intent).await.ok();
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "ErrPermission",
            format!("{} requires {}", principal.name, permission.as_str()),
        ));
    }
    Ok(principal)
}

/// Mutating endpoints refuse work during chain-integrity lockdown
fn check_lockdown(state: &AppState) -> ApiResult<()> {
    if state.ledger.in_lockdown() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "ErrIntegrity",
            "service is in chain-integrity lockdown",
        ));
    }
    Ok(())
}

/// Mutating calls record the acting principal alongside the resource
async fn record_access(state: &AppState, principal: &Principal, action: &str, resource: &str) {
    let intent = LedgerIntent::new(EventType::AccessGranted).metadata(serde_json::json!({
        "principal": principal.name,
        "action": action,
        "resource": resource,
    }));
    state.ledger.record_nowait(intent).await.ok();
}

// ============================================================================
// Ingestion endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct IngestRequest {
    /// Complete codec frame, base64
    #[serde(default)]
    frame_b64: Option<String>,
    /// Raw-sample alternative to `frame_b64`
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    data_type: Option<String>,
    #[serde(default)]
    sampling_rate_hz: Option<u32>,
    #[serde(default)]
    chunk_seq: Option<u64>,
    #[serde(default)]
    device_ts_ns: Option<i64>,
    #[serde(default)]
    channels: Option<Vec<ChannelInfo>>,
    /// samples[channel][n], float32 in canonical units
    #[serde(default)]
    samples: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    session_id: String,
    samples_processed: usize,
    quality: f64,
    ledger_event_id: Option<String>,
}

async fn ingest_neural_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IngestRequest>,
) -> ApiResult<Json<IngestResponse>> {
    let principal = authorize(&state, &headers, Permission::WriteNeuralData).await?;
    check_lockdown(&state)?;

    let user_id = body.user_id.as_deref();
    let receipt = if let Some(frame_b64) = &body.frame_b64 {
        let frame = base64::engine::general_purpose::STANDARD
            .decode(frame_b64)
            .map_err(|e| {
                ApiError::new(StatusCode::BAD_REQUEST, "ErrValidation", format!("frame_b64: {e}"))
            })?;
        state.ingestion.ingest_frame(user_id, &frame).await?
    } else {
        let chunk = chunk_from_body(&body)?;
        state.ingestion.ingest_chunk(user_id, chunk).await?
    };

    record_access(&state, &principal, "ingest", &receipt.session_id).await;
    Ok(Json(IngestResponse {
        session_id: receipt.session_id,
        samples_processed: receipt.samples_processed,
        quality: receipt.quality,
        ledger_event_id: receipt.ledger_event_id,
    }))
}

fn chunk_from_body(body: &IngestRequest) -> ApiResult<SampleChunk> {
    let missing = |field: &str| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "ErrValidation",
            format!("missing field {field}"),
        )
    };
    let data_type = body
        .data_type
        .as_deref()
        .and_then(DataType::parse)
        .ok_or_else(|| missing("data_type"))?;
    Ok(SampleChunk {
        session_id: body.session_id.clone().ok_or_else(|| missing("session_id"))?,
        device_id: body.device_id.clone().ok_or_else(|| missing("device_id"))?,
        data_type,
        sampling_rate_hz: body.sampling_rate_hz.ok_or_else(|| missing("sampling_rate_hz"))?,
        channels: body.channels.clone().ok_or_else(|| missing("channels"))?,
        samples: body.samples.clone().ok_or_else(|| missing("samples"))?,
        chunk_seq: body.chunk_seq.ok_or_else(|| missing("chunk_seq"))?,
        device_ts_ns: body.device_ts_ns.ok_or_else(|| missing("device_ts_ns"))?,
        ingest_ts_ns: now_ns(),
    })
}

async fn batch_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let principal = authorize(&state, &headers, Permission::WriteNeuralData).await?;
    check_lockdown(&state)?;

    let field = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "ErrValidation", e.to_string()))?
        .ok_or_else(|| {
            ApiError::new(StatusCode::BAD_REQUEST, "ErrValidation", "empty multipart body")
        })?;
    let bytes = field
        .bytes()
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "ErrValidation", e.to_string()))?;

    let anon = state.ingestion.anonymizer().anonymize(&principal.name);
    let upload = state
        .batches
        .store(&state.ingestion, Some(&anon), &bytes)
        .await?;

    // Replay in the background through the normal path
    {
        let batches = state.batches.clone();
        let ingestion = state.ingestion.clone();
        let path = upload.path.clone();
        tokio::spawn(async move {
            if let Err(e) = batches.replay(ingestion, &path, None).await {
                tracing::warn!("batch replay failed: {e}");
            }
        });
    }

    record_access(&state, &principal, "batch-upload", &upload.batch_id).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "batch_id": upload.batch_id,
            "ledger_event_id": upload.ledger_event_id,
        })),
    ))
}

async fn ingest_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    authorize(&state, &headers, Permission::ReadFeatures).await?;
    Ok(Json(serde_json::json!({
        "ingest": state.ingestion.metrics().await,
        "pipeline": state.pipeline.metrics(),
    })))
}

// ============================================================================
// Session endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct SessionStartRequest {
    #[serde(default)]
    paradigm: Option<String>,
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default)]
    user_id: Option<String>,
}

async fn session_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SessionStartRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = authorize(&state, &headers, Permission::WriteNeuralData).await?;
    check_lockdown(&state)?;
    let user = body.user_id.as_deref().unwrap_or(principal.name.as_str());
    let session = state
        .manager
        .start_session(user, &body.devices, body.paradigm.as_deref())
        .await?;
    record_access(&state, &principal, "session-start", &session.session_id).await;
    Ok(Json(serde_json::json!({
        "session_id": session.session_id,
        "version": session.version,
    })))
}

#[derive(Debug, Deserialize)]
struct SessionEndRequest {
    session_id: String,
}

async fn session_end(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SessionEndRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = authorize(&state, &headers, Permission::WriteNeuralData).await?;
    check_lockdown(&state)?;
    match state.manager.current_session().await {
        Some(active) if active == body.session_id => {}
        _ => {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                "ErrSessionConflict",
                format!("session {} is not the active session", body.session_id),
            ))
        }
    }
    let session = state.manager.end_session().await?;
    record_access(&state, &principal, "session-end", &session.session_id).await;
    Ok(Json(serde_json::to_value(&session).map_err(EngineError::from)?))
}

async fn session_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    authorize(&state, &headers, Permission::ReadSessions).await?;
    let session = state.sessions.get(&session_id).await?;
    Ok(Json(serde_json::to_value(&session).map_err(EngineError::from)?))
}

// ============================================================================
// Device endpoints
// ============================================================================

async fn devices_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    authorize(&state, &headers, Permission::ReadSessions).await?;
    let devices = state.manager.list_devices().await;
    Ok(Json(serde_json::to_value(&devices).map_err(EngineError::from)?))
}

#[derive(Debug, Deserialize)]
struct CreateDeviceRequest {
    discovery: crate::discovery::DiscoveredDevice,
    #[serde(default)]
    params: serde_json::Value,
}

async fn devices_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateDeviceRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = authorize(&state, &headers, Permission::WriteNeuralData).await?;
    check_lockdown(&state)?;
    let info = state
        .manager
        .create_from_discovery(&body.discovery, body.params)
        .await?;
    record_access(&state, &principal, "device-create", &info.device_id).await;
    Ok(Json(serde_json::to_value(&info).map_err(EngineError::from)?))
}

async fn device_connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = authorize(&state, &headers, Permission::WriteNeuralData).await?;
    check_lockdown(&state)?;
    let device_state = state.manager.connect(&device_id).await?;
    record_access(&state, &principal, "device-connect", &device_id).await;
    Ok(Json(serde_json::json!({"state": device_state.as_str()})))
}

#[derive(Debug, Deserialize)]
struct StreamStartRequest {
    session_id: String,
}

async fn device_stream_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
    Json(body): Json<StreamStartRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = authorize(&state, &headers, Permission::WriteNeuralData).await?;
    check_lockdown(&state)?;
    // Streaming is device-set wide; the path id scopes the response
    state.manager.start_streaming(&body.session_id).await?;
    let device_state = state.manager.device_state(&device_id).await?;
    record_access(&state, &principal, "stream-start", &device_id).await;
    Ok(Json(serde_json::json!({"state": device_state.as_str()})))
}

async fn device_impedance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    authorize(&state, &headers, Permission::ExecuteAnalysis).await?;
    let ohms = state.manager.check_impedance(&device_id).await?;
    Ok(Json(serde_json::to_value(&ohms).map_err(EngineError::from)?))
}

async fn device_signal_quality(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    authorize(&state, &headers, Permission::ExecuteAnalysis).await?;
    let report = state
        .manager
        .get_signal_quality(&device_id, Duration::from_secs(2))
        .await?;
    Ok(Json(serde_json::to_value(&report).map_err(EngineError::from)?))
}

async fn devices_health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    authorize(&state, &headers, Permission::ReadSessions).await?;
    let snapshots = state.manager.health_snapshots().await;
    Ok(Json(serde_json::to_value(&snapshots).map_err(EngineError::from)?))
}

async fn devices_health_alerts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    authorize(&state, &headers, Permission::ReadSessions).await?;
    let alerts = state.manager.health_alerts().await;
    Ok(Json(serde_json::to_value(&alerts).map_err(EngineError::from)?))
}

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    /// Timeout in whole seconds, `?timeout=5s` style values accepted
    #[serde(default)]
    timeout: Option<String>,
}

async fn devices_discover(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DiscoverQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    authorize(&state, &headers, Permission::ReadSessions).await?;
    let mut options = DiscoveryOptions::from_config(&state.config.devices);
    if let Some(timeout) = query.timeout.as_deref() {
        let seconds: u64 = timeout
            .trim_end_matches('s')
            .parse()
            .map_err(|_| {
                ApiError::new(StatusCode::BAD_REQUEST, "ErrValidation", "bad timeout")
            })?;
        options.timeout = Duration::from_secs(seconds.clamp(1, 60));
    }
    let report = state.manager.scan(&options).await;
    Ok(Json(serde_json::to_value(&report).map_err(EngineError::from)?))
}

// ============================================================================
// Ledger endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(default)]
    from: Option<u64>,
    #[serde(default)]
    to: Option<u64>,
    #[serde(default)]
    shard: Option<u32>,
}

async fn ledger_verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<Json<VerifyOutcome>> {
    authorize(&state, &headers, Permission::ReadSessions).await?;
    let shard = query.shard.unwrap_or(0);
    let from = query.from.unwrap_or(0);
    let to = match query.to {
        Some(to) => to,
        None => state
            .ledger_store
            .tip(shard)
            .await
            .map_err(ApiError::from)?
            .map(|(seq, _)| seq)
            .unwrap_or(0),
    };
    let outcome = state
        .ledger_store
        .verify(shard, from, to, None)
        .await
        .map_err(ApiError::from)?;
    if !outcome.is_ok() {
        // A verified violation blocks the shard until adjudication
        state.ledger.trigger_lockdown(shard);
    }
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct PurgeRequest {
    user_id_anon: String,
}

async fn admin_purge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PurgeRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let principal = authorize(&state, &headers, Permission::Admin).await?;
    check_lockdown(&state)?;

    // Raw and derived stores forget the subject; the ledger records the
    // purge instead of deleting anything
    let session_ids = state
        .sessions
        .sessions_for_subject(&body.user_id_anon)
        .await?;
    let mut frames_purged = 0u64;
    for session_id in &session_ids {
        frames_purged += state.pipeline.derived().purge_session(session_id).await?;
    }
    let sessions_purged = state.sessions.purge_subject(&body.user_id_anon).await?;

    let intent = LedgerIntent::new(EventType::PurgeExecuted)
        .user(&body.user_id_anon)
        .metadata(serde_json::json!({
            "scope": format!("user:{}", body.user_id_anon),
            "sessions": sessions_purged,
            "frames": frames_purged,
            "principal": principal.name,
        }));
    let event = state.ledger.record(intent).await?;

    Ok(Json(serde_json::json!({
        "sessions_purged": sessions_purged,
        "frames_purged": frames_purged,
        "ledger_event_id": event.event_id.to_string(),
    })))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// ============================================================================
// Router
// ============================================================================

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        // Ingestion
        .route("/v1/ingest/neural-data", post(ingest_neural_data))
        .route("/v1/ingest/batch-upload", post(batch_upload))
        .route("/v1/ingest/metrics", get(ingest_metrics))
        // Sessions
        .route("/v1/sessions/:id", get(session_get))
        .route("/v1/session/start", post(session_start))
        .route("/v1/session/end", post(session_end))
        // Devices
        .route("/v1/devices", get(devices_list).post(devices_create))
        .route("/v1/devices/:id/connect", post(device_connect))
        .route("/v1/devices/:id/stream/start", post(device_stream_start))
        .route("/v1/devices/:id/impedance", get(device_impedance))
        .route("/v1/devices/:id/signal-quality", get(device_signal_quality))
        .route("/v1/devices/health", get(devices_health))
        .route("/v1/devices/health/alerts", get(devices_health_alerts))
        .route("/v1/devices/discover", get(devices_discover))
        // Ledger
        .route("/v1/ledger/verify", get(ledger_verify))
        // Admin
        .route("/v1/admin/purge", post(admin_purge))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let addr = state.config.server.bind_addr();
    let app = create_router(state);
    info!("neural engine control plane listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, IngestConfig};
    use crate::ledger::LedgerWriter;
    use crate::log::MemoryLog;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> (AppState, LedgerWriter) {
        let config = Arc::new(EngineConfig::default());
        let sessions = SessionStore::connect("sqlite::memory:").await.unwrap();
        let ledger_store = LedgerStore::connect("sqlite::memory:").await.unwrap();
        let writer = LedgerWriter::spawn(
            ledger_store.clone(),
            None,
            1,
            Duration::from_secs(5),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        let log = Arc::new(MemoryLog::new());
        let ingestion = IngestionService::new(
            IngestConfig::default(),
            sessions.clone(),
            log.clone(),
            writer.handle(),
        );
        let derived = crate::pipeline::DerivedStore::connect("sqlite::memory:")
            .await
            .unwrap();
        let pipeline = ProcessingPipeline::new(
            crate::config::PipelineConfig::default(),
            log,
            derived,
            writer.handle(),
        );
        let manager = DeviceManager::new(
            DeviceConfig::default(),
            sessions.clone(),
            ingestion.clone(),
            writer.handle(),
        );
        let auth = Arc::new(
            AuthRegistry::from_spec(
                "writer=tok-w=write:neural_data;read:sessions,reader=tok-r=read:sessions",
                false,
            )
            .unwrap(),
        );
        let state = AppState {
            config,
            auth,
            manager,
            ingestion,
            pipeline,
            ledger: writer.handle(),
            ledger_store,
            sessions,
            batches: BatchStore::new(std::env::temp_dir().join("neurascale-test-batches")),
        };
        (state, writer)
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let (state, _writer) = test_state().await;
        let app = create_router(state);
        let response = app
            .oneshot(request("POST", "/v1/session/start", None, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_insufficient_role_is_403_and_ledgered() {
        let (state, _writer) = test_state().await;
        let store = state.ledger_store.clone();
        let app = create_router(state);
        let response = app
            .oneshot(request(
                "POST",
                "/v1/session/start",
                Some("tok-r"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        // access_denied landed on the chain
        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = store.analytical_range(0, 0, 10).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::AccessDenied));
    }

    #[tokio::test]
    async fn test_session_start_and_get() {
        let (state, _writer) = test_state().await;
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/session/start",
                Some("tok-w"),
                serde_json::json!({"paradigm": "rest", "devices": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let session_id = body["session_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(request(
                "GET",
                &format!("/v1/sessions/{session_id}"),
                Some("tok-r"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ingest_rejects_corrupted_frame_with_400() {
        let (state, _writer) = test_state().await;
        let session = state.sessions.create("anon", &[], None).await.unwrap();
        let app = create_router(state);

        let mut chunk = crate::chunk::test_chunk(2, 32);
        chunk.session_id = session.session_id;
        let mut frame = crate::codec::encode(&chunk).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 1;
        let body = serde_json::json!({
            "frame_b64": base64::engine::general_purpose::STANDARD.encode(&frame),
        });
        let response = app
            .oneshot(request("POST", "/v1/ingest/neural-data", Some("tok-w"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "ErrChecksum");
    }

    #[tokio::test]
    async fn test_lockdown_returns_503_on_mutations() {
        let (state, _writer) = test_state().await;
        state.ledger.trigger_lockdown(0);
        let app = create_router(state);
        let response = app
            .oneshot(request(
                "POST",
                "/v1/session/start",
                Some("tok-w"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_verify_endpoint_ok_and_violation_locks() {
        let (state, _writer) = test_state().await;
        // Build a small chain
        for _ in 0..3 {
            state
                .ledger
                .record(LedgerIntent::new(EventType::DataIngested).session("s"))
                .await
                .unwrap();
        }
        let app = create_router(state.clone());
        let response = app
            .clone()
            .oneshot(request(
                "GET",
                "/v1/ledger/verify?from=0&to=2",
                Some("tok-r"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let outcome: VerifyOutcome = serde_json::from_slice(&bytes).unwrap();
        assert!(outcome.is_ok());
        assert!(!state.ledger.in_lockdown());

        // Tamper, verify again: violation + lockdown
        sqlx::query("UPDATE ledger_analytical SET event = replace(event, 'data_ingested', 'key_rotated') WHERE seq = 1")
            .execute(state.ledger_store.pool())
            .await
            .unwrap();
        let response = app
            .oneshot(request(
                "GET",
                "/v1/ledger/verify?from=0&to=2",
                Some("tok-r"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let outcome: VerifyOutcome = serde_json::from_slice(&bytes).unwrap();
        assert!(!outcome.is_ok());
        assert!(state.ledger.in_lockdown());
    }
}
