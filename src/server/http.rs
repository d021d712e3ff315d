use super::state::AppState;
use crate::config::RateLimitConfig;
use crate::error::DecisionError;
use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::error;
use uuid::Uuid;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

const ADMIN_KEY_PREFIXES: &[(&str, &str)] = &[
    ("token_bucket", "ratelimit:bucket:"),
    ("sliding_window", "ratelimit:sliding:"),
    ("sliding_window_counter", "ratelimit:swc:"),
    ("fixed_window", "ratelimit:fixed:"),
    ("leaky_bucket", "ratelimit:leaky:"),
    ("key_configs", "config:key:"),
    ("pattern_configs", "config:pattern:"),
];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckRequest {
    key: String,
    tokens: u64,
    #[serde(default)]
    #[allow(dead_code)]
    client_ip: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    endpoint: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckResponse {
    allowed: bool,
    remaining_tokens: i64,
    reset_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<i64>,
    algorithm: String,
    metadata: CheckMetadata,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckMetadata {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    matched_pattern: Option<String>,
    latency_micros: u64,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
}

#[derive(Serialize)]
struct KeyDescriptor {
    key: String,
}

#[derive(Serialize)]
struct StatsBody {
    counts: BTreeMap<String, usize>,
}

/// Entry point for the single listener — dispatches every route in §6 of
/// the spec (decision check, config CRUD, admin, health/ready/metrics),
/// times the request, and echoes/generates `X-Request-Id`.
pub async fn handle(
    req: Request<Incoming>,
    state: AppState,
    _peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let request_id = request_id_for(&req);

    metrics::gauge!("ratelimit_http_requests_in_flight").increment(1.0);

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut response = match (method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) | ("GET", ["healthz"]) => handle_health(),
        ("GET", ["ready"]) | ("GET", ["readyz"]) => handle_ready(&state),
        ("GET", ["metrics"]) => handle_metrics(&state),

        ("POST", ["api", "ratelimit", "check"]) => match collect_body(req).await {
            Ok(bytes) => handle_check(&state, bytes).await,
            Err(resp) => resp,
        },

        ("GET", ["api", "ratelimit", "config", "patterns"]) => handle_list_patterns(&state).await,
        ("POST", ["api", "ratelimit", "config", "reload"]) => handle_reload(&state).await,

        ("POST", ["api", "ratelimit", "config", "keys", key]) => {
            let key = key.to_string();
            match collect_body(req).await {
                Ok(bytes) => handle_save_key(&state, &key, &bytes).await,
                Err(resp) => resp,
            }
        }
        ("DELETE", ["api", "ratelimit", "config", "keys", key]) => {
            handle_delete_key(&state, key).await
        }
        ("POST", ["api", "ratelimit", "config", "patterns", pat]) => {
            let pat = pat.to_string();
            match collect_body(req).await {
                Ok(bytes) => handle_save_pattern(&state, &pat, &bytes).await,
                Err(resp) => resp,
            }
        }
        ("DELETE", ["api", "ratelimit", "config", "patterns", pat]) => {
            handle_delete_pattern(&state, pat).await
        }
        ("GET", ["api", "ratelimit", "config", key]) => handle_get_config(&state, key).await,

        ("GET", ["api", "admin", "keys"]) => handle_admin_keys_get(&state, &query).await,
        ("DELETE", ["api", "admin", "keys"]) => handle_admin_delete_key_query(&state, &query).await,
        ("DELETE", ["api", "admin", "keys", pat]) => handle_admin_delete_pattern(&state, pat).await,
        ("GET", ["api", "admin", "stats"]) => handle_admin_stats(&state).await,
        ("POST", ["api", "admin", "cache", "clear"]) => handle_admin_cache_clear(&state).await,

        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    };

    metrics::gauge!("ratelimit_http_requests_in_flight").decrement(1.0);
    metrics::histogram!("ratelimit_http_request_duration_seconds").record(start.elapsed().as_secs_f64());

    if let Ok(v) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(HeaderName::from_static("x-request-id"), v);
    }
    Ok(response)
}

fn request_id_for(req: &Request<Incoming>) -> String {
    req.headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn collect_body(req: Request<Incoming>) -> Result<Bytes, Response<BoxBody>> {
    match req.into_body().collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => Err(json_error(
            StatusCode::BAD_REQUEST,
            &format!("failed to read request body: {e}"),
        )),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, Response<BoxBody>> {
    serde_json::from_slice(bytes)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, &format!("invalid request body: {e}")))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(bytes))
        .expect("valid response")
}

fn json_error(status: StatusCode, msg: &str) -> Response<BoxBody> {
    json_response(status, &ErrorBody { error: msg.to_string() })
}

fn empty_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .expect("valid response")
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

fn decision_error_response(e: DecisionError) -> Response<BoxBody> {
    match e {
        DecisionError::InvalidInput(msg) => json_error(StatusCode::BAD_REQUEST, &msg),
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, &other.to_string()),
    }
}

async fn handle_check(state: &AppState, bytes: Bytes) -> Response<BoxBody> {
    let body: CheckRequest = match parse_json(&bytes) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if body.key.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "key must not be blank");
    }
    if body.tokens < 1 {
        return json_error(StatusCode::BAD_REQUEST, "tokens must be >= 1");
    }

    let started = Instant::now();
    let decision = match state.orchestrator.check(&body.key, body.tokens).await {
        Ok(d) => d,
        Err(e) => return decision_error_response(e),
    };
    let latency_micros = started.elapsed().as_micros() as u64;

    // Resolved again (cache hit — `check` already paid for this lookup) purely
    // to surface which pattern, if any, governed this key in the response
    // metadata; the orchestrator's own contract has no reason to expose it.
    let matched_pattern = state
        .resolver
        .get_config(&body.key)
        .await
        .ok()
        .and_then(|cfg| cfg.key_pattern.clone())
        .filter(|p| p != &body.key);

    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    let retry_after_seconds = decision.retry_after_secs.map(|s| s.ceil() as i64);
    let reset_time = decision.reset_at.to_rfc3339();

    let body = CheckResponse {
        allowed: decision.allowed,
        remaining_tokens: decision.remaining,
        reset_time: reset_time.clone(),
        retry_after_seconds,
        algorithm: decision.algorithm.as_str().to_string(),
        metadata: CheckMetadata {
            key: body.key,
            matched_pattern,
            latency_micros,
        },
    };

    let mut response = json_response(status, &body);
    if !decision.allowed {
        let headers = response.headers_mut();
        if let Ok(v) = HeaderValue::from_str(&body.remaining_tokens.to_string()) {
            headers.insert(HeaderName::from_static("x-ratelimit-remaining"), v);
        }
        if let Ok(v) = HeaderValue::from_str(&reset_time) {
            headers.insert(HeaderName::from_static("x-ratelimit-reset"), v);
        }
        if let Some(secs) = retry_after_seconds {
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                headers.insert(HeaderName::from_static("retry-after"), v);
            }
        }
    }
    response
}

async fn handle_get_config(state: &AppState, key: &str) -> Response<BoxBody> {
    match state.resolver.get_config(key).await {
        Ok(cfg) => json_response(StatusCode::OK, &*cfg),
        Err(e) => decision_error_response(e),
    }
}

async fn handle_save_key(state: &AppState, key: &str, bytes: &[u8]) -> Response<BoxBody> {
    let cfg: RateLimitConfig = match parse_json(bytes) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match state.resolver.save_key_config(key, cfg).await {
        Ok(()) => json_response(StatusCode::CREATED, &StatusBody { status: "created" }),
        Err(e) => decision_error_response(e),
    }
}

async fn handle_save_pattern(state: &AppState, pattern: &str, bytes: &[u8]) -> Response<BoxBody> {
    let cfg: RateLimitConfig = match parse_json(bytes) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match state.resolver.save_pattern_config(pattern, cfg).await {
        Ok(()) => json_response(StatusCode::CREATED, &StatusBody { status: "created" }),
        Err(e) => decision_error_response(e),
    }
}

async fn handle_delete_key(state: &AppState, key: &str) -> Response<BoxBody> {
    match state.resolver.delete_key_config(key).await {
        Ok(()) => empty_response(StatusCode::NO_CONTENT),
        Err(e) => decision_error_response(e),
    }
}

async fn handle_delete_pattern(state: &AppState, pattern: &str) -> Response<BoxBody> {
    match state.resolver.delete_pattern_config(pattern).await {
        Ok(()) => empty_response(StatusCode::NO_CONTENT),
        Err(e) => decision_error_response(e),
    }
}

async fn handle_list_patterns(state: &AppState) -> Response<BoxBody> {
    match state.resolver.get_all_patterns().await {
        Ok(list) => json_response(StatusCode::OK, &list),
        Err(e) => decision_error_response(e),
    }
}

async fn handle_reload(state: &AppState) -> Response<BoxBody> {
    match state.resolver.reload_configurations().await {
        Ok(()) => json_response(StatusCode::OK, &StatusBody { status: "reloaded" }),
        Err(e) => decision_error_response(e),
    }
}

async fn handle_admin_keys_get(state: &AppState, query: &str) -> Response<BoxBody> {
    let limit = query_param(query, "limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(100);
    match state.store.scan("ratelimit:").await {
        Ok(keys) => {
            let descriptors: Vec<KeyDescriptor> =
                keys.into_iter().take(limit).map(|key| KeyDescriptor { key }).collect();
            json_response(StatusCode::OK, &descriptors)
        }
        Err(e) => decision_error_response(e),
    }
}

async fn handle_admin_stats(state: &AppState) -> Response<BoxBody> {
    let mut counts = BTreeMap::new();
    for (name, prefix) in ADMIN_KEY_PREFIXES.iter().copied() {
        match state.store.scan(prefix).await {
            Ok(keys) => {
                counts.insert((*name).to_string(), keys.len());
            }
            Err(e) => return decision_error_response(e),
        }
    }
    json_response(StatusCode::OK, &StatsBody { counts })
}

async fn handle_admin_delete_key_query(state: &AppState, query: &str) -> Response<BoxBody> {
    let Some(key) = query_param(query, "key") else {
        return json_error(StatusCode::BAD_REQUEST, "missing key query parameter");
    };
    match state.store.delete(&[key.to_string()]).await {
        Ok(()) => empty_response(StatusCode::NO_CONTENT),
        Err(e) => decision_error_response(e),
    }
}

async fn handle_admin_delete_pattern(state: &AppState, prefix: &str) -> Response<BoxBody> {
    match state.store.scan(prefix).await {
        Ok(keys) => match state.store.delete(&keys).await {
            Ok(()) => empty_response(StatusCode::NO_CONTENT),
            Err(e) => decision_error_response(e),
        },
        Err(e) => decision_error_response(e),
    }
}

async fn handle_admin_cache_clear(state: &AppState) -> Response<BoxBody> {
    match state.resolver.reload_configurations().await {
        Ok(()) => json_response(StatusCode::OK, &StatusBody { status: "cleared" }),
        Err(e) => decision_error_response(e),
    }
}

fn handle_health() -> Response<BoxBody> {
    json_response(StatusCode::OK, &StatusBody { status: "ok" })
}

fn handle_ready(state: &AppState) -> Response<BoxBody> {
    if state.is_ready() {
        json_response(StatusCode::OK, &StatusBody { status: "ready" })
    } else {
        json_response(StatusCode::SERVICE_UNAVAILABLE, &StatusBody { status: "not_ready" })
    }
}

fn handle_metrics(state: &AppState) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(full_body(state.metrics.render()))
        .expect("valid response")
}
