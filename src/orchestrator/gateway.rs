//! HTTP surface: health, metrics, state reads, and request-style envelope
//! transport. Route paths come from the endpoint table in
//! `contract::taxonomy`.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Orchestrator;
use crate::contract::{build_error_response, build_success_response, error_response_for, lookup_endpoint};
use crate::error::{CoreError, CoreResult};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::state::UpdateOptions;

const SERVICE: &str = "gateway";
const MAX_BODY: usize = 1 << 20;
const STOP_WAIT: Duration = Duration::from_secs(5);

type Shared = Arc<Orchestrator>;
type Reply = Result<Json<Value>, CoreError>;

pub struct GatewayHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting; in-flight requests get `STOP_WAIT` to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let mut task = self.task;
        if tokio::time::timeout(STOP_WAIT, &mut task).await.is_err() {
            task.abort();
        }
        log(
            Level::Info,
            Domain::Gateway,
            "gateway_stopped",
            obj(&[("addr", v_str(&self.addr.to_string()))]),
        );
    }
}

pub(crate) fn router(orchestrator: Shared) -> CoreResult<Router> {
    let path = |name: &str| lookup_endpoint(SERVICE, name).map(|e| e.path);
    Ok(Router::new()
        .route(path("health")?, get(health))
        .route(path("metrics")?, get(metrics))
        .route(path("global-state")?, get(global_state))
        .route(path("component-state")?, get(component_state))
        .route(path("state-update")?, post(update_state))
        .route(path("components")?, get(components))
        .route(path("register")?, post(register))
        .route(path("message")?, post(message))
        .route(path("heartbeat")?, post(heartbeat))
        .fallback(not_found)
        .layer(middleware::from_fn(log_request))
        .layer(DefaultBodyLimit::max(MAX_BODY))
        .with_state(orchestrator))
}

pub(crate) async fn spawn(orchestrator: Shared, addr: SocketAddr) -> CoreResult<GatewayHandle> {
    let startup = |reason: String| CoreError::Startup {
        stage: "gateway".to_string(),
        reason,
    };
    let app = router(orchestrator).map_err(|e| startup(e.to_string()))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| startup(format!("bind {}: {}", addr, e)))?;
    let bound = listener.local_addr().map_err(|e| startup(e.to_string()))?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await;
        if let Err(e) = served {
            log(
                Level::Error,
                Domain::Gateway,
                "gateway_failed",
                obj(&[("error", v_str(&e.to_string()))]),
            );
        }
    });
    log(
        Level::Info,
        Domain::Gateway,
        "gateway_started",
        obj(&[("addr", v_str(&bound.to_string()))]),
    );
    Ok(GatewayHandle {
        addr: bound,
        shutdown_tx,
        task,
    })
}

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::ComponentNotFound(_) | CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Delivery { .. } => StatusCode::BAD_GATEWAY,
        CoreError::LockTimeout { .. } | CoreError::ShuttingDown(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Persistence(_) | CoreError::Startup { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        (status_for(&self), Json(error_response_for(&self))).into_response()
    }
}

fn ok<T: Serialize>(data: T) -> Reply {
    Ok(Json(build_success_response(json!(data), None)))
}

fn parse_body(body: &Bytes) -> CoreResult<Value> {
    serde_json::from_slice(body).map_err(|e| CoreError::invalid("body", format!("invalid json: {}", e)))
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    log(
        Level::Debug,
        Domain::Gateway,
        "request",
        obj(&[
            ("method", v_str(&method)),
            ("path", v_str(&path)),
            ("status", json!(response.status().as_u16())),
        ]),
    );
    response
}

async fn health(State(orchestrator): State<Shared>) -> Response {
    let health = orchestrator.get_health();
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

async fn metrics(State(orchestrator): State<Shared>) -> Reply {
    ok(orchestrator.get_metrics())
}

async fn global_state(State(orchestrator): State<Shared>) -> Reply {
    ok(orchestrator.get_global_state())
}

async fn components(State(orchestrator): State<Shared>) -> Reply {
    ok(orchestrator.components())
}

async fn component_state(State(orchestrator): State<Shared>, Path(id): Path<String>) -> Reply {
    ok(orchestrator.get_component_state(&id).await?)
}

async fn update_state(State(orchestrator): State<Shared>, Path(id): Path<String>, body: Bytes) -> Reply {
    let patch = parse_body(&body)?;
    ok(orchestrator
        .update_component_state(&id, patch, UpdateOptions::default())
        .await?)
}

async fn register(State(orchestrator): State<Shared>, body: Bytes) -> Reply {
    let component_id = orchestrator.register_frame(&parse_body(&body)?).await?;
    ok(json!({ "componentId": component_id }))
}

async fn message(State(orchestrator): State<Shared>, body: Bytes) -> Reply {
    ok(orchestrator.route_frame(&parse_body(&body)?).await?)
}

async fn heartbeat(State(orchestrator): State<Shared>, Path(id): Path<String>) -> Reply {
    orchestrator.heartbeat(&id)?;
    ok(json!({ "componentId": id }))
}

async fn not_found(method: Method, uri: Uri) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(build_error_response(
            "NOT_FOUND",
            json!({ "method": method.as_str(), "path": uri.path() }),
        )),
    )
}
