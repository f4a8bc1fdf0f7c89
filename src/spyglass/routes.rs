use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::spyglass::{
    address::parse_address,
    icon,
    resolver::{ResolveError, Service, StatusOptions, BEDROCK_DEFAULT_PORT, JAVA_DEFAULT_PORT},
};

const DEFAULT_TIMEOUT_SECS: f64 = 5.0;
const MIN_TIMEOUT_SECS: f64 = 0.5;

pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/status/java/{address}", get(java_status))
        .route("/status/bedrock/{address}", get(bedrock_status))
        .route("/icon", get(default_icon))
        .route("/icon/{address}", get(server_icon))
        .with_state(service)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Default, Deserialize)]
struct StatusParams {
    query: Option<bool>,
    timeout: Option<f64>,
    bypass_cache: Option<bool>,
}

async fn ping() -> impl IntoResponse {
    StatusCode::OK
}

async fn java_status(
    State(service): State<Arc<Service>>,
    Path(address): Path<String>,
    Query(params): Query<StatusParams>,
    headers: HeaderMap,
) -> Response {
    let Ok((host, port)) = parse_address(&address, JAVA_DEFAULT_PORT) else {
        return invalid_address();
    };

    let opts = status_options(&service, &params, &headers);
    match service.resolve_java(&host, port, &opts).await {
        Ok((body, ttl)) => json_body(body, ttl),
        Err(err) => internal_error("java status", &address, err),
    }
}

async fn bedrock_status(
    State(service): State<Arc<Service>>,
    Path(address): Path<String>,
    Query(params): Query<StatusParams>,
    headers: HeaderMap,
) -> Response {
    let Ok((host, port)) = parse_address(&address, BEDROCK_DEFAULT_PORT) else {
        return invalid_address();
    };

    let opts = status_options(&service, &params, &headers);
    match service.resolve_bedrock(&host, port, &opts).await {
        Ok((body, ttl)) => json_body(body, ttl),
        Err(err) => internal_error("bedrock status", &address, err),
    }
}

async fn server_icon(
    State(service): State<Arc<Service>>,
    Path(address): Path<String>,
    Query(params): Query<StatusParams>,
    headers: HeaderMap,
) -> Response {
    let Ok((host, port)) = parse_address(&address, JAVA_DEFAULT_PORT) else {
        return invalid_address();
    };

    let opts = status_options(&service, &params, &headers);
    match service.resolve_icon(&host, port, &opts).await {
        Ok((body, ttl)) => png_body(body, ttl),
        Err(err) => internal_error("icon", &address, err),
    }
}

async fn default_icon() -> Response {
    png_body(icon::DEFAULT_ICON.to_vec(), Duration::ZERO)
}

/// Fold the query string into probe options. `bypass_cache` only counts when
/// the caller's Authorization header is on the configured allowlist.
fn status_options(service: &Service, params: &StatusParams, headers: &HeaderMap) -> StatusOptions {
    let timeout = params
        .timeout
        .filter(|t| t.is_finite())
        .unwrap_or(DEFAULT_TIMEOUT_SECS)
        .max(MIN_TIMEOUT_SECS);

    let bypass_cache = params.bypass_cache.unwrap_or(false) && authorized(service, headers);

    StatusOptions {
        query: params.query.unwrap_or(true),
        timeout: Duration::from_secs_f64(timeout),
        bypass_cache,
    }
}

fn authorized(service: &Service, headers: &HeaderMap) -> bool {
    let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    service.config.auth_tokens.iter().any(|t| t == token.trim())
}

fn invalid_address() -> Response {
    (StatusCode::BAD_REQUEST, "Invalid address value").into_response()
}

fn internal_error(what: &str, address: &str, err: ResolveError) -> Response {
    tracing::error!(address, err = %err, "routes: {what} failed");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

fn json_body(body: Vec<u8>, ttl: Duration) -> Response {
    let mut resp = (
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response();
    set_cache_headers(&mut resp, ttl);
    resp
}

fn png_body(body: Vec<u8>, ttl: Duration) -> Response {
    let mut resp = (
        [(header::CONTENT_TYPE, HeaderValue::from_static("image/png"))],
        body,
    )
        .into_response();
    set_cache_headers(&mut resp, ttl);
    resp
}

fn set_cache_headers(resp: &mut Response, ttl: Duration) {
    let hit = ttl > Duration::ZERO;
    resp.headers_mut().insert(
        "x-cache-hit",
        HeaderValue::from_static(if hit { "true" } else { "false" }),
    );
    if hit {
        if let Ok(v) = HeaderValue::from_str(&ttl.as_secs().to_string()) {
            resp.headers_mut().insert("x-cache-time-remaining", v);
        }
    }
}
