use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::stream::unfold;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::negotiation::ConnectivityState;
use crate::session::SessionHandle;
use crate::telemetry::WireStatsSnapshot;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct ControlPlane {
    token: String,
    bound_addr: SocketAddr,
}

struct ControlState {
    token: String,
    session: SessionHandle,
}

impl std::fmt::Debug for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlState")
            .field("token", &"[redacted]")
            .field("session", &self.session.session_id())
            .finish()
    }
}

impl ControlPlane {
    /// Bind the local HTTP control plane and serve it until `shutdown` fires.
    ///
    /// If the requested port is taken the server falls back to an OS-assigned
    /// port on the same interface; callers read the real address back from
    /// [`ControlPlane::bound_addr`].
    pub async fn start(
        addr: &str,
        token: Option<String>,
        session: SessionHandle,
        shutdown: Arc<Notify>,
    ) -> anyhow::Result<ControlPlane> {
        let token = token.unwrap_or_else(|| Uuid::new_v4().as_simple().to_string());

        let requested_addr: SocketAddr = addr.parse().map_err(|e| {
            anyhow::anyhow!("invalid control address '{addr}': {e} (use a numeric IP, not a hostname)")
        })?;

        let listener = match tokio::net::TcpListener::bind(requested_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(requested = %requested_addr, error = %e, "control port unavailable, trying fallback");
                let fallback = SocketAddr::new(requested_addr.ip(), 0);
                tokio::net::TcpListener::bind(fallback).await.map_err(|fallback_err| {
                    anyhow::anyhow!(
                        "failed to bind control plane: {requested_addr} ({e}), fallback ({fallback_err})"
                    )
                })?
            }
        };
        let bound_addr = listener.local_addr()?;

        let state = Arc::new(ControlState {
            token: token.clone(),
            session,
        });
        let app = router(state);

        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.notified().await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "control plane server error");
            }
            info!("control plane stopped");
        });

        info!(addr = %bound_addr, "control plane listening");
        Ok(ControlPlane { token, bound_addr })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

fn router(state: Arc<ControlState>) -> Router {
    let authenticated = Router::new()
        .route("/v1/session", get(session_snapshot))
        .route("/v1/files", post(send_file))
        .route("/v1/messages", post(send_message))
        .route("/v1/events", get(events))
        .with_state(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Status stays public for health probes.
    Router::new()
        .route("/v1/status", get(status))
        .with_state(state)
        .merge(authenticated)
}

async fn auth_middleware(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let expected = format!("Bearer {}", state.token);
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if value.to_str().map(|v| v == expected).unwrap_or(false) {
            return next.run(req).await;
        }
    }
    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    #[serde(rename = "ts")]
    timestamp: String,
    version: String,
    session_id: String,
    online: bool,
    connection: ConnectivityState,
    stats: WireStatsSnapshot,
}

async fn status(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let snap = state.session.snapshot();
    Json(StatusResponse {
        status: "ok".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        session_id: snap.session_id,
        online: snap.signaling_online,
        connection: snap.connection,
        stats: snap.stats,
    })
}

async fn session_snapshot(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    Json(state.session.snapshot())
}

#[derive(Deserialize)]
struct SendFileRequest {
    path: String,
}

#[derive(Serialize)]
struct SendFileResponse {
    ids: Vec<String>,
}

async fn send_file(
    State(state): State<Arc<ControlState>>,
    Json(req): Json<SendFileRequest>,
) -> impl IntoResponse {
    if req.path.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "path is required").into_response();
    }
    match state.session.send_file(&req.path).await {
        Ok(ids) => (StatusCode::ACCEPTED, Json(SendFileResponse { ids })).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, format!("{e:#}")).into_response(),
    }
}

#[derive(Deserialize)]
struct SendMessageRequest {
    text: String,
}

async fn send_message(
    State(state): State<Arc<ControlState>>,
    Json(req): Json<SendMessageRequest>,
) -> impl IntoResponse {
    if req.text.is_empty() {
        return (StatusCode::BAD_REQUEST, "text is required").into_response();
    }
    match state.session.send_text(req.text) {
        Ok(id) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "id": id }))).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn events(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let rx = state.session.subscribe();
    let stream = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(n) => {
                    let data = serde_json::to_string(&n).unwrap_or_else(|_| "{}".to_string());
                    let ev = Event::default().event(n.kind()).data(data);
                    return Some((Ok::<_, std::convert::Infallible>(ev), rx));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}
