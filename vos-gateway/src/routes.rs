//! Axum route handlers for the vos gateway API.

use std::convert::Infallible;
use std::path::PathBuf;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream, StreamExt,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use vos_core::{Ports, ResourceSpec, RunId, StateChange, VmState};
use vos_vm::{VmInstance, VmLauncher};

use crate::{error::GatewayError, state::AppState};

// ── Request / response types ──────────────────────────────────────────────────

/// Body of `POST /v1/vm/start`. Both fields fall back to the configuration.
#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
pub struct StartBody {
    pub image_path: Option<PathBuf>,
    pub shared_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub state: VmState,
}

/// Snapshot returned by `GET /v1/vm`.
#[derive(Debug, Serialize)]
pub struct VmStatus {
    pub state: VmState,
    pub last_change: Option<StateChange>,
    pub instance: Option<InstanceView>,
}

/// The running hypervisor, as reported to clients.
#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub run_id: RunId,
    pub pid: Option<u32>,
    pub image: PathBuf,
    pub shared_dir: PathBuf,
    pub ports: Ports,
    pub resources: ResourceSpec,
    pub started_at: DateTime<Utc>,
}

impl From<VmInstance> for InstanceView {
    fn from(instance: VmInstance) -> Self {
        Self {
            run_id: instance.run_id,
            pid: instance.pid,
            image: instance.image,
            shared_dir: instance.shared_dir,
            ports: instance.ports,
            resources: instance.resources,
            started_at: instance.started_at,
        }
    }
}

/// Parse a start request body. An empty body means "use the defaults".
///
/// # Errors
/// Returns [`GatewayError::InvalidRequest`] if the body is not a JSON object
/// of the expected shape or names an empty path.
pub fn parse_start_body(bytes: &[u8]) -> Result<StartBody, GatewayError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(StartBody::default());
    }
    let body: StartBody = serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::InvalidRequest(format!("malformed start body: {e}")))?;
    for (field, path) in [("image_path", &body.image_path), ("shared_dir", &body.shared_dir)] {
        if path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            return Err(GatewayError::InvalidRequest(format!("{field} must not be empty")));
        }
    }
    Ok(body)
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the application router around a controller.
pub fn create_router<L: VmLauncher>(state: AppState<L>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/vm", get(vm_status::<L>))
        .route("/v1/vm/start", post(start_vm::<L>))
        .route("/v1/vm/stop", post(stop_vm::<L>))
        .route("/v1/vm/engine/ping", get(ping_engine::<L>))
        .route("/v1/vm/events", get(vm_events::<L>))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health`: liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// `GET /v1/vm`: current state, the last transition and the running instance.
pub async fn vm_status<L: VmLauncher>(State(app): State<AppState<L>>) -> Json<VmStatus> {
    let vm = app.vm();
    Json(VmStatus {
        state: vm.state().await,
        last_change: vm.last_change().await,
        instance: vm.instance().await.map(InstanceView::from),
    })
}

/// `POST /v1/vm/start`: boot the VM. Returns once the hypervisor is
/// spawned; readiness is reported on the event stream.
///
/// # Errors
/// Returns [`GatewayError::InvalidRequest`] for a malformed body and
/// [`GatewayError::Vm`] when the launch fails.
pub async fn start_vm<L: VmLauncher>(
    State(app): State<AppState<L>>,
    body: Bytes,
) -> Result<impl IntoResponse, GatewayError> {
    let body = parse_start_body(&body)?;
    let vm = app.vm();
    vm.start(body.image_path, body.shared_dir).await?;
    let state = vm.state().await;
    Ok((StatusCode::ACCEPTED, Json(StateResponse { state })))
}

/// `POST /v1/vm/stop`: tear the VM down. Idempotent.
pub async fn stop_vm<L: VmLauncher>(State(app): State<AppState<L>>) -> Json<StateResponse> {
    let vm = app.vm();
    vm.stop().await;
    Json(StateResponse { state: vm.state().await })
}

/// `GET /v1/vm/engine/ping`: authenticated ping through the live handle.
///
/// # Errors
/// Returns [`GatewayError::EngineNotReady`] unless the VM is ready, and
/// [`GatewayError::Vm`] if the ping itself fails.
pub async fn ping_engine<L: VmLauncher>(
    State(app): State<AppState<L>>,
) -> Result<impl IntoResponse, GatewayError> {
    let vm = app.vm();
    let Some(engine) = vm.engine().await else {
        return Err(GatewayError::EngineNotReady(vm.state().await));
    };
    engine.ping().await?;
    Ok(Json(serde_json::json!({"ping": "OK"})))
}

/// `GET /v1/vm/events`: server-sent `log` and `state` events.
///
/// Subscribers that fall behind skip what they missed.
pub async fn vm_events<L: VmLauncher>(
    State(app): State<AppState<L>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let vm = app.vm();
    let logs = BroadcastStream::new(vm.subscribe_logs()).filter_map(|item| to_event("log", item));
    let states =
        BroadcastStream::new(vm.subscribe_states()).filter_map(|item| to_event("state", item));
    let stream = futures::StreamExt::take_until(logs.merge(states), app.shutdown_token().cancelled_owned());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_event<T: Serialize>(
    name: &'static str,
    item: Result<T, BroadcastStreamRecvError>,
) -> Option<Result<Event, Infallible>> {
    match item {
        Ok(payload) => match Event::default().event(name).json_data(payload) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!(event = name, error = %e, "dropping unserializable event");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::debug!(event = name, skipped, "event subscriber lagged");
            None
        }
    }
}
