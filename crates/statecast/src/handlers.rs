//! Token endpoint and channel-upgrade handshake.

use crate::admission::{extract_client_ip, request_host, request_origin};
use crate::connection::handle_connection;
use crate::dispatch::JoinRequest;
use crate::error::{Rejection, StatecastError};
use crate::metrics::counters;
use crate::server::ServerState;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Largest inbound WebSocket message accepted. Viewers never need to send data.
const MAX_INBOUND_MESSAGE: usize = 4096;

fn origin_rejected() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({ "error": Rejection::OriginNotAllowed.to_string() })),
    )
        .into_response()
}

/// Attach CORS headers scoped to the presented origin.
fn apply_cors(headers: &mut HeaderMap, origin: Option<&str>, preflight: bool) {
    let Some(value) = origin.and_then(|o| HeaderValue::from_str(o).ok()) else {
        return;
    };
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    if preflight {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        );
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("600"),
        );
    }
}

/// `GET /session-token`: issue a token bound to the caller's IP and origin.
pub async fn session_token(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, StatecastError> {
    let origin = request_origin(&headers);
    let host = request_host(&headers);
    let ip = extract_client_ip(&headers, &peer_addr, state.config.trust_proxy);

    if !state.policy.is_token_request_allowed(origin, host) {
        counters::token_requests_total("rejected");
        warn!(
            %ip,
            host = host.unwrap_or_default(),
            origin = origin.unwrap_or_default(),
            "token request from disallowed origin"
        );
        return Ok(origin_rejected());
    }

    let issued = state.core.issue_token(ip, origin.map(str::to_owned)).await?;
    counters::token_requests_total("issued");

    let mut response = Json(issued).into_response();
    apply_cors(response.headers_mut(), origin, false);
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// `OPTIONS /session-token`: answer the cross-origin preflight.
pub async fn session_token_preflight(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Response {
    let origin = request_origin(&headers);
    if !state
        .policy
        .is_token_request_allowed(origin, request_host(&headers))
    {
        return origin_rejected();
    }
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors(response.headers_mut(), origin, true);
    response
}

/// Channel-upgrade handshake on any other path.
///
/// Every check runs before the upgrade completes so a refused client gets a
/// plain HTTP status it can act on.
pub async fn channel_upgrade(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Result<Response, StatecastError> {
    let origin = request_origin(&headers);
    let host = request_host(&headers).unwrap_or_default();
    let ip = extract_client_ip(&headers, &peer_addr, state.config.trust_proxy);
    let path = uri.path();

    let outcome = if state.policy.is_token_request_allowed(origin, Some(host)) {
        let request = JoinRequest {
            ip,
            origin: origin.map(str::to_owned),
            path_and_query: uri
                .path_and_query()
                .map_or_else(|| path.to_string(), |pq| pq.as_str().to_string()),
        };
        state.core.join(request).await?
    } else {
        Err(Rejection::OriginNotAllowed)
    };

    match outcome {
        Ok(joined) => {
            counters::admissions_total("admitted");
            info!(%ip, host, path, conn_id = joined.id, "push channel admitted");
            let core = state.core.clone();
            Ok(ws
                .max_message_size(MAX_INBOUND_MESSAGE)
                .max_frame_size(MAX_INBOUND_MESSAGE)
                .on_upgrade(move |socket| handle_connection(socket, joined, core)))
        }
        Err(rejection) => {
            counters::admissions_total(rejection.reason());
            warn!(
                %ip,
                host,
                path,
                origin = origin.unwrap_or_default(),
                reason = rejection.reason(),
                status = rejection.status().as_u16(),
                "channel upgrade rejected"
            );
            Ok(rejection.into_response())
        }
    }
}
