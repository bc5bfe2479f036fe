//! Management HTTP surface: static UI, JSON-RPC, event streams.
//!
//! Served over a bounded slot pool (`MGMT_SLOTS` concurrent requests, the
//! rest shed with 503) with a per-request timeout. Long-lived event
//! streams hand their slot back once the response head is out.

pub mod events;
pub mod rpc;

use axum::Router;
use axum::body::Body;
use axum::error_handling::HandleErrorLayer;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{get, post};
use futures::stream;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tracing::info;

use crate::net::types::{MGMT_IDLE_TIMEOUT, MGMT_SLOTS};

use self::events::Topic;
use self::rpc::{RpcContext, RpcRequest};

const INDEX_HTML: &str = include_str!("ui/index.html");
const SCRIPT_JS: &str = include_str!("ui/script.js");

/// Serve the management API until shutdown fires.
pub async fn serve(
    ctx: RpcContext,
    bind: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/", get(index))
        .route("/script.js", get(script))
        .route("/v1", post(rpc_handler))
        .route("/events/:topic", get(events_handler))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(shed_error))
                .load_shed()
                .concurrency_limit(MGMT_SLOTS)
                .timeout(Duration::from_secs(MGMT_IDLE_TIMEOUT)),
        )
        .with_state(ctx);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("management API on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

/// Slot pool full → 503, request overran its timeout → 408.
async fn shed_error(err: tower::BoxError) -> StatusCode {
    if err.is::<tower::timeout::error::Elapsed>() {
        StatusCode::REQUEST_TIMEOUT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn script() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/javascript")], SCRIPT_JS)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn rpc_handler(
    State(ctx): State<RpcContext>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(rpc::parse_error())),
    };
    let (status, reply) = rpc::dispatch(&ctx, request, bearer(&headers)).await;
    (status, Json(reply))
}

/// RS-delimited JSON stream (`\x1e` + JSON + `\n` per record). One
/// subscriber per topic; subscribing again replaces the previous stream.
async fn events_handler(
    State(ctx): State<RpcContext>,
    Path(topic): Path<String>,
) -> axum::response::Response {
    let Ok(topic) = topic.parse::<Topic>() else {
        return (StatusCode::NOT_FOUND, "unknown event topic\n").into_response();
    };
    let rx = ctx.events.subscribe(topic);
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|line| (Ok::<_, Infallible>(line), rx))
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json-seq")],
        Body::from_stream(stream),
    )
        .into_response()
}
