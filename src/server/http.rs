//! HTTP API of a node
//!
//! - `GET|PUT|DELETE /v0/entity?id=<key>[&replicas=ack/from]`: replicated access
//! - `GET /v0/entities?start=<key>[&end=<key>]`: local range scan, streamed as
//!   `key\nvalue\n` records
//! - `POST /v0/compact`: schedule a local compaction
//! - `GET /v0/status`: liveness and local counters
//!
//! A request carrying `X-OK-Proxy: true` comes from a coordinating peer and is
//! applied locally only; its answers carry the write time in `X-OK-Timestamp`.

use crate::cluster::{GetOutcome, QuorumCoordinator, ReplicationFactor, WriteOutcome};
use crate::common::{Error, Result};
use crate::server::client::HttpReplicaClient;
use crate::storage::Engine;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::{BufMut, BytesMut};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;

/// Marks a request sent by a coordinating peer.
pub const PROXY_HEADER: &str = "x-ok-proxy";
/// Write time of the value (or tombstone) in a proxied answer.
pub const TIMESTAMP_HEADER: &str = "x-ok-timestamp";

/// Records buffered between the storage scan and the response body.
const RANGE_CHANNEL_CAPACITY: usize = 64;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct NodeState {
    pub engine: Arc<Engine>,
    pub coordinator: Arc<QuorumCoordinator<HttpReplicaClient>>,
}

/// Creates the HTTP router with all public endpoints.
pub fn create_router(state: NodeState) -> Router {
    Router::new()
        .route("/v0/status", axum::routing::get(status))
        .route(
            "/v0/entity",
            axum::routing::get(get_entity)
                .put(put_entity)
                .delete(delete_entity),
        )
        .route("/v0/entities", axum::routing::get(get_entities))
        .route("/v0/compact", axum::routing::post(compact))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct EntityParams {
    id: Option<String>,
    replicas: Option<String>,
}

impl EntityParams {
    fn parse(self) -> Result<(Bytes, Option<ReplicationFactor>)> {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidKey("missing id".into()))?;
        let rf = self
            .replicas
            .as_deref()
            .map(ReplicationFactor::parse)
            .transpose()?;
        Ok((Bytes::from(id), rf))
    }
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    start: Option<String>,
    end: Option<String>,
}

fn is_proxied(headers: &HeaderMap) -> bool {
    headers
        .get(PROXY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn error_response(e: Error) -> Response {
    let status = e.to_http_status();
    if status.is_server_error() {
        tracing::error!("Request failed: {}", e);
    } else {
        tracing::debug!("Request rejected: {}", e);
    }
    (status, e.to_string()).into_response()
}

async fn status(State(state): State<NodeState>) -> impl IntoResponse {
    let ring = state.coordinator.ring();
    axum::Json(json!({
        "status": "ok",
        "node": ring.me(),
        "nodes": ring.nodes(),
        "version": env!("CARGO_PKG_VERSION"),
        "storage": state.engine.stats(),
    }))
}

async fn get_entity(
    State(state): State<NodeState>,
    headers: HeaderMap,
    Query(params): Query<EntityParams>,
) -> Response {
    let (key, rf) = match params.parse() {
        Ok(parsed) => parsed,
        Err(e) => return error_response(e),
    };
    let proxied = is_proxied(&headers);

    match state.coordinator.get(key, rf, proxied).await {
        Ok(GetOutcome::Found { value, timestamp }) if proxied => (
            StatusCode::OK,
            [(TIMESTAMP_HEADER, timestamp.to_string())],
            value,
        )
            .into_response(),
        Ok(GetOutcome::Found { value, .. }) => (StatusCode::OK, value).into_response(),
        Ok(GetOutcome::NotFound {
            timestamp: Some(timestamp),
        }) if proxied => (
            StatusCode::NOT_FOUND,
            [(TIMESTAMP_HEADER, timestamp.to_string())],
        )
            .into_response(),
        Ok(GetOutcome::NotFound { .. }) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

async fn put_entity(
    State(state): State<NodeState>,
    headers: HeaderMap,
    Query(params): Query<EntityParams>,
    body: Bytes,
) -> Response {
    let (key, rf) = match params.parse() {
        Ok(parsed) => parsed,
        Err(e) => return error_response(e),
    };
    let result = state
        .coordinator
        .put(key, body, rf, is_proxied(&headers))
        .await;
    write_response(result)
}

async fn delete_entity(
    State(state): State<NodeState>,
    headers: HeaderMap,
    Query(params): Query<EntityParams>,
) -> Response {
    let (key, rf) = match params.parse() {
        Ok(parsed) => parsed,
        Err(e) => return error_response(e),
    };
    let result = state
        .coordinator
        .delete(key, rf, is_proxied(&headers))
        .await;
    write_response(result)
}

fn write_response(result: Result<WriteOutcome>) -> Response {
    match result {
        Ok(WriteOutcome::Created) => StatusCode::CREATED.into_response(),
        Ok(WriteOutcome::Accepted) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

/// Streams `key\nvalue\n` for every live key in `[start, end)` on this node.
async fn get_entities(
    State(state): State<NodeState>,
    Query(params): Query<RangeParams>,
) -> Response {
    let Some(start) = params.start.filter(|s| !s.is_empty()) else {
        return error_response(Error::InvalidKey("missing start".into()));
    };
    let end = params.end;

    let engine = Arc::clone(&state.engine);
    let range = tokio::task::spawn_blocking(move || {
        engine.range(start.as_bytes(), end.as_deref().map(str::as_bytes))
    })
    .await
    .map_err(|e| Error::Internal(format!("range task failed: {}", e)))
    .and_then(|range| range);
    let range = match range {
        Ok(range) => range,
        Err(e) => return error_response(e),
    };

    let (tx, rx) =
        tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(RANGE_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || {
        for item in range {
            let record = match item {
                Ok((key, value)) => {
                    let mut buf = BytesMut::with_capacity(key.len() + value.len() + 2);
                    buf.put_slice(&key);
                    buf.put_u8(b'\n');
                    buf.put_slice(&value);
                    buf.put_u8(b'\n');
                    Ok(buf.freeze())
                }
                Err(e) => {
                    tracing::error!("Range scan failed: {}", e);
                    Err(std::io::Error::other(e.to_string()))
                }
            };
            let failed = record.is_err();
            // A closed channel means the client went away.
            if tx.blocking_send(record).is_err() || failed {
                break;
            }
        }
    });

    (StatusCode::OK, Body::from_stream(ReceiverStream::new(rx))).into_response()
}

async fn compact(State(state): State<NodeState>) -> Response {
    let engine = Arc::clone(&state.engine);
    let result = tokio::task::spawn_blocking(move || engine.compact())
        .await
        .map_err(|e| Error::Internal(format!("compaction task failed: {}", e)))
        .and_then(|scheduled| scheduled);
    match result {
        Ok(()) => (StatusCode::OK, "compaction scheduled").into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_entity_params() {
        let params = EntityParams {
            id: Some("k".into()),
            replicas: Some("2/3".into()),
        };
        let (key, rf) = params.parse().unwrap();
        assert_eq!(key, "k");
        assert_eq!(rf, Some(ReplicationFactor::new(2, 3).unwrap()));

        let missing = EntityParams {
            id: Some(String::new()),
            replicas: None,
        };
        assert!(matches!(missing.parse(), Err(Error::InvalidKey(_))));

        let bad_rf = EntityParams {
            id: Some("k".into()),
            replicas: Some("4/3".into()),
        };
        assert!(matches!(bad_rf.parse(), Err(Error::InvalidReplication(_))));
    }

    #[test]
    fn test_proxy_header() {
        let mut headers = HeaderMap::new();
        assert!(!is_proxied(&headers));
        headers.insert(PROXY_HEADER, HeaderValue::from_static("true"));
        assert!(is_proxied(&headers));
        headers.insert(PROXY_HEADER, HeaderValue::from_static("no"));
        assert!(!is_proxied(&headers));
    }
}
