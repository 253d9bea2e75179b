//! Per-worktree reverse proxy with availability gating.
//!
//! Mounted under `/wt/{name}`. Requests for unknown or invalid names
//! fail fast; requests for worktrees that are not serving get a 503 in
//! the shape the caller can digest (JSON for API-ish requests, minimal
//! HTML otherwise). Everything else forwards to the worktree's
//! container on loopback, cookies included, with `X-Worktree-Name`
//! stamped on the response.
//!
//! WebSocket upgrades are handled on the same `/wt/` routes only, so
//! the orchestrator's own realtime namespace is never intercepted.

use axum::body::Body;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::git::validate_worktree_name;
use crate::store::Database;
use crate::worktree::WorktreeRecord;

const WORKTREE_NAME_HEADER: &str = "x-worktree-name";

#[derive(Clone)]
pub struct ProxyState {
    db: Database,
    http: reqwest::Client,
}

impl ProxyState {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client construction is infallible with static options"),
        }
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/wt/{name}", any(handle))
        .route("/wt/{name}/{*rest}", any(handle))
        .with_state(state)
}

/// Whether an unavailability response should be JSON: the client asked
/// for it, or the path is an API surface.
fn wants_json(accept: Option<&HeaderValue>, path: &str) -> bool {
    let accepts_json = accept
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);
    accepts_json
        || path.contains("/api/")
        || path.contains("/mcp/")
        || path.contains("/socket.io/")
}

fn stamp_name(response: &mut Response, name: &str) {
    if let Ok(value) = HeaderValue::from_str(name) {
        response.headers_mut().insert(WORKTREE_NAME_HEADER, value);
    }
}

fn unavailable_response(record: &WorktreeRecord, json: bool) -> Response {
    let message = format!("Worktree '{}' is not running", record.name);
    let mut response = if json {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({
                "statusCode": 503,
                "message": message,
                "worktreeName": record.name,
            })),
        )
            .into_response()
    } else {
        let html = format!(
            "<!doctype html><html><head><title>Worktree unavailable</title></head>\
             <body><h1>503</h1><p>{message}</p></body></html>"
        );
        let mut response = (StatusCode::SERVICE_UNAVAILABLE, html).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response
    };
    stamp_name(&mut response, &record.name);
    response
}

async fn handle(
    State(state): State<ProxyState>,
    Path(params): Path<std::collections::HashMap<String, String>>,
    req: Request,
) -> Response {
    let name = params.get("name").cloned().unwrap_or_default();
    let path = req.uri().path().to_string();

    if validate_worktree_name(&name).is_err() {
        let err =
            crate::error::OrchestratorError::validation_field("invalid worktree name", "name");
        return (StatusCode::BAD_REQUEST, axum::Json(err.envelope())).into_response();
    }

    let record = match state.db.worktrees().get_by_name(&name).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            let err = crate::error::OrchestratorError::not_found("worktree", &name);
            let mut response =
                (StatusCode::NOT_FOUND, axum::Json(err.envelope())).into_response();
            stamp_name(&mut response, &name);
            return response;
        }
        Err(err) => {
            let mut response = (
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY),
                axum::Json(err.envelope()),
            )
                .into_response();
            stamp_name(&mut response, &name);
            return response;
        }
    };

    let available = record.status.is_available() && record.container_port.is_some();
    if !available {
        let json = wants_json(req.headers().get(header::ACCEPT), &path);
        return unavailable_response(&record, json);
    }
    let port = record.container_port.expect("checked above");

    if is_websocket_upgrade(req.headers()) {
        return upgrade_websocket(req, &record, port).await;
    }

    forward_http(&state, req, &record, port).await
}

fn is_websocket_upgrade(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

async fn forward_http(
    state: &ProxyState,
    req: Request,
    record: &WorktreeRecord,
    port: u16,
) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("http://127.0.0.1:{port}{path_and_query}");

    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, 16 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("could not read request body: {err}"),
            )
                .into_response()
        }
    };

    let mut upstream = state.http.request(parts.method.clone(), &url);
    for (key, value) in parts.headers.iter() {
        if key == header::HOST {
            continue;
        }
        upstream = upstream.header(key, value);
    }

    let upstream_response = match upstream.body(body_bytes).send().await {
        Ok(response) => response,
        Err(err) => {
            warn!("proxy to worktree '{}' failed: {err}", record.name);
            let json = wants_json(parts.headers.get(header::ACCEPT), parts.uri.path());
            return unavailable_response(record, json);
        }
    };

    let status = upstream_response.status();
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (key, value) in upstream_response.headers().iter() {
            headers.insert(key.clone(), value.clone());
        }
    }
    let body = match upstream_response.bytes().await {
        Ok(bytes) => Body::from(bytes),
        Err(err) => {
            warn!("reading upstream body for '{}' failed: {err}", record.name);
            Body::empty()
        }
    };

    let mut response = builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    stamp_name(&mut response, &record.name);
    debug!("proxied {} -> {status} for worktree '{}'", path_and_query, record.name);
    response
}

async fn upgrade_websocket(req: Request, record: &WorktreeRecord, port: u16) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let backend_url = format!("ws://127.0.0.1:{port}{path_and_query}");
    let name = record.name.clone();

    let (mut parts, _body) = req.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let mut response = upgrade.on_upgrade(move |client| async move {
        match tokio_tungstenite::connect_async(backend_url.as_str()).await {
            Ok((backend, _)) => relay_websocket(client, backend).await,
            Err(err) => warn!("websocket connect to worktree '{name}' failed: {err}"),
        }
    });
    stamp_name(&mut response, &record.name);
    response
}

/// Shuttle frames between the client socket and the backend socket
/// until either side closes.
async fn relay_websocket(
    client: WebSocket,
    backend: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let to_backend = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let forwarded = match message {
                AxumMessage::Text(text) => WsMessage::text(text.to_string()),
                AxumMessage::Binary(data) => WsMessage::binary(data),
                AxumMessage::Ping(data) => WsMessage::Ping(data),
                AxumMessage::Pong(data) => WsMessage::Pong(data),
                AxumMessage::Close(_) => break,
            };
            if backend_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = backend_tx.close().await;
    };

    let to_client = async {
        while let Some(Ok(message)) = backend_rx.next().await {
            let forwarded = match message {
                WsMessage::Text(text) => AxumMessage::Text(text.as_str().into()),
                WsMessage::Binary(data) => AxumMessage::Binary(data),
                WsMessage::Ping(data) => AxumMessage::Ping(data),
                WsMessage::Pong(data) => AxumMessage::Pong(data),
                WsMessage::Close(_) => break,
                WsMessage::Frame(_) => continue,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::join!(to_backend, to_client);
}
