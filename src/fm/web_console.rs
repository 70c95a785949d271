use crate::fm::config::WebConsoleConfig;
use crate::fm::rpc::{EventsResponse, LogsResponse, StartRequest, StopResponse};
use crate::fm::supervisor::Supervisor;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
struct WebState {
    supervisor: Arc<Supervisor>,
}

pub fn build_router(supervisor: Arc<Supervisor>) -> Router {
    let api = Router::new()
        .route("/status", get(status))
        .route("/logs", get(logs))
        .route("/events", get(events))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .with_state(WebState { supervisor });

    Router::new().nest("/api/anvil", api)
}

async fn status(State(st): State<WebState>) -> AxumResponse {
    Json(st.supervisor.status().await).into_response()
}

async fn logs(State(st): State<WebState>) -> AxumResponse {
    Json(LogsResponse { logs: st.supervisor.logs() }).into_response()
}

async fn events(State(st): State<WebState>) -> AxumResponse {
    Json(EventsResponse { events: st.supervisor.events() }).into_response()
}

async fn start(State(st): State<WebState>, Json(req): Json<StartRequest>) -> AxumResponse {
    if req.fork_url.trim().is_empty() {
        let v = serde_json::json!({ "ok": false, "error": "fork_url is required" });
        return (StatusCode::BAD_REQUEST, Json(v)).into_response();
    }
    let out = st.supervisor.start(&req.fork_url, req.chain_id).await;
    if out.ok {
        let v = serde_json::json!({ "ok": true, "message": out.message });
        (StatusCode::OK, Json(v)).into_response()
    } else {
        let v = serde_json::json!({ "ok": false, "message": out.message, "error": out.message });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(v)).into_response()
    }
}

async fn stop(State(st): State<WebState>) -> AxumResponse {
    Json(StopResponse { stopped: st.supervisor.stop().await }).into_response()
}

/// Serve the API until `shutdown` flips to true.
pub async fn serve(
    cfg: WebConsoleConfig,
    supervisor: Arc<Supervisor>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", cfg.bind, cfg.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("web_console bind/port invalid: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("web_console failed to bind {addr}: {e}"))?;
    tracing::info!(component = "web", "web_console listening bind={} port={}", cfg.bind, cfg.port);

    let app = build_router(supervisor);
    let graceful = async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    };
    axum::serve(listener, app).with_graceful_shutdown(graceful).await?;
    Ok(())
}
