//! Request dispatch for the OCI pull-through cache.
//!
//! Routes:
//! - `GET  /healthz`                                  - liveness probe
//! - `GET  /metrics`                                  - Prometheus metrics
//! - `GET  /v2/`                                      - version check, auth challenges relayed
//! - `GET/HEAD /v2/.../manifests/{ref}`               - manifest fetch, cache-first
//! - `GET/HEAD /v2/.../blobs/{digest}`                - blob fetch, cache-first
//! - `GET/HEAD /v2/.../referrers/{digest}`            - bounded passthrough, never cached
//! - anything else under `/v2/`                       - 405 OCI error (read-only proxy)
//!
//! GET requests walk the cache ladder: presigned redirect, then streaming
//! from the store (with range support when the body is seekable), then an
//! upstream fetch whose body is teed into the store without ever letting a
//! store failure corrupt the client copy.

pub mod logging;
pub mod path;
pub mod range;
pub mod upstream;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::cache::{CacheBody, ObjectMeta, Store};
use crate::metrics::{HitLabels, HitMode, MetricsRegistry};
use crate::stream::tee_to_store;
use path::{Kind, RegistryMode, RequestInfo};
use upstream::UpstreamClient;

const API_VERSION_HEADER: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");
const API_VERSION_VALUE: HeaderValue = HeaderValue::from_static("registry/2.0");

/// Headers that apply to a single transport hop and are never forwarded or
/// stored.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Bound on the whole upstream exchange for the secondary referrers API.
const REFERRERS_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub upstream: UpstreamClient,
    pub mode: RegistryMode,
    pub cache_tag_manifests: bool,
    pub cache_latest_tag: bool,
    pub metrics: MetricsRegistry,
}

impl AppState {
    /// Whether this request's response should be cached. Blobs and digest
    /// manifests always are (content-addressed, immutable); referrers never;
    /// tag manifests are an operator opt-in, with an extra gate on `latest`
    /// because it moves so much more often.
    fn should_cache(&self, info: &RequestInfo) -> bool {
        if info.kind == Kind::Referrers {
            return false;
        }
        if !info.is_tag_manifest() {
            return true;
        }
        if !self.cache_tag_manifests {
            return false;
        }
        if info.reference == "latest" && !self.cache_latest_tag {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`]: fixed routes for health and metrics, the OCI
/// dispatch state machine for everything else.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(dispatch)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            logging::log_requests,
        ))
        .with_state(state)
}

/// `GET /healthz`
async fn handle_health() -> &'static str {
    "ok"
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// The OCI state machine: version check, method discipline, parse, then the
/// per-kind branches.
async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, _body) = request.into_parts();
    let method = parts.method;
    let headers = parts.headers;

    let raw_path = parts.uri.path();
    let sub_path = raw_path.strip_prefix("/v2").unwrap_or(raw_path);
    let sub_path = sub_path.strip_prefix('/').unwrap_or(sub_path);

    // GET /v2/ — proxy to upstream so auth challenges (401 + Www-Authenticate)
    // flow through.
    if sub_path.is_empty() {
        return handle_v2_check(&state, method, &headers).await;
    }

    if method != Method::GET && method != Method::HEAD {
        return oci_error(
            StatusCode::METHOD_NOT_ALLOWED,
            "UNSUPPORTED",
            "read-only proxy: method not allowed",
        );
    }

    let info = match path::parse_path(sub_path, &state.mode) {
        Ok(info) => info,
        Err(err) => return plain_error(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    debug!(
        %method,
        image = %info.image(),
        kind = %info.kind,
        reference = %info.short_ref(),
        "request"
    );

    // Referrers — pass through to upstream, no caching.
    if info.kind == Kind::Referrers {
        return handle_passthrough(&state, method, &headers, &info).await;
    }

    let key = path::storage_key(&info);

    if method == Method::HEAD {
        return handle_head(&state, &headers, &info, &key).await;
    }

    handle_get(&state, &headers, &info, &key).await
}

async fn handle_v2_check(state: &AppState, method: Method, headers: &HeaderMap) -> Response {
    let registry = match &state.mode {
        RegistryMode::SingleUpstream(registry) => registry.clone(),
        // With no configured upstream there is nothing to relay challenges
        // from; answer the version check ourselves.
        RegistryMode::InPath => return synthesized_v2_ok(),
    };

    match state.upstream.do_v2_check(method, headers, &registry).await {
        Ok(resp) => {
            let mut out = copy_response_headers(resp.headers());
            out.insert(API_VERSION_HEADER, API_VERSION_VALUE);
            let status = resp.status();
            response_with(status, out, Body::from_stream(resp.bytes_stream()))
        }
        Err(err) => {
            debug!(error = %err, "upstream /v2/ check failed");
            synthesized_v2_ok()
        }
    }
}

fn synthesized_v2_ok() -> Response {
    let mut out = HeaderMap::new();
    out.insert(API_VERSION_HEADER, API_VERSION_VALUE);
    response_with(StatusCode::OK, out, Body::empty())
}

/// HEAD — answer from cache metadata when possible, otherwise forward.
async fn handle_head(
    state: &AppState,
    headers: &HeaderMap,
    info: &RequestInfo,
    key: &str,
) -> Response {
    if state.should_cache(info) {
        if let Ok(meta) = state.store.head(key).await {
            let mut out = replay_stored_headers(&meta);
            out.insert(API_VERSION_HEADER, API_VERSION_VALUE);
            set_cache_control(&mut out, info);
            return response_with(StatusCode::OK, out, Body::empty());
        }
    }

    // Cache miss or tag manifest — forward HEAD to upstream.
    match state.upstream.execute(Method::HEAD, headers, info).await {
        Ok(resp) => {
            let mut out = copy_response_headers(resp.headers());
            out.insert(API_VERSION_HEADER, API_VERSION_VALUE);
            response_with(resp.status(), out, Body::empty())
        }
        Err(err) => {
            debug!(error = %err, "upstream HEAD failed");
            plain_error(StatusCode::BAD_GATEWAY, "upstream error")
        }
    }
}

/// Referrers — forwarded with a bounded deadline so a slow upstream cannot
/// tie up this secondary API.
async fn handle_passthrough(
    state: &AppState,
    method: Method,
    headers: &HeaderMap,
    info: &RequestInfo,
) -> Response {
    match state
        .upstream
        .execute_bounded(method, headers, info, REFERRERS_TIMEOUT)
        .await
    {
        Ok(resp) => {
            let mut out = copy_response_headers(resp.headers());
            out.insert(API_VERSION_HEADER, API_VERSION_VALUE);
            let status = resp.status();
            response_with(status, out, Body::from_stream(resp.bytes_stream()))
        }
        Err(err) => {
            debug!(kind = %info.kind, error = %err, "upstream passthrough failed");
            plain_error(StatusCode::GATEWAY_TIMEOUT, "upstream unavailable")
        }
    }
}

/// GET — cache ladder: redirect, stream-from-store, then upstream with a
/// teed write-through.
async fn handle_get(
    state: &AppState,
    headers: &HeaderMap,
    info: &RequestInfo,
    key: &str,
) -> Response {
    let cacheable = state.should_cache(info);
    let metrics = &state.metrics.metrics;

    if cacheable {
        // 1. Redirect for backends that issue presigned URLs.
        if let Some(redirector) = state.store.redirector() {
            match redirector.redirect_url(key).await {
                Ok((url, meta)) => {
                    info!(
                        image = %info.image(),
                        kind = %info.kind,
                        reference = %info.short_ref(),
                        "cache hit (redirect)"
                    );
                    metrics
                        .cache_hits_total
                        .get_or_create(&HitLabels {
                            mode: HitMode::Redirect,
                        })
                        .inc();

                    let mut out = replay_stored_headers(&meta);
                    out.insert(API_VERSION_HEADER, API_VERSION_VALUE);
                    set_cache_control(&mut out, info);
                    // The redirect itself carries no body; the stored length
                    // describes the object behind the signed URL.
                    out.remove(header::CONTENT_LENGTH);
                    match HeaderValue::from_str(&url) {
                        Ok(location) => {
                            out.insert(header::LOCATION, location);
                            return response_with(
                                StatusCode::TEMPORARY_REDIRECT,
                                out,
                                Body::empty(),
                            );
                        }
                        Err(err) => {
                            debug!(error = %err, "presigned URL not header-safe");
                            // Fall through to the streaming path.
                        }
                    }
                }
                // Cache miss or presign failure — fall through.
                Err(err) => debug!(key, error = %err, "redirect attempt failed"),
            }
        }

        // 2. Stream from the store.
        if let Ok(result) = state.store.get(key).await {
            info!(
                image = %info.image(),
                kind = %info.kind,
                reference = %info.short_ref(),
                "cache hit"
            );
            metrics
                .cache_hits_total
                .get_or_create(&HitLabels {
                    mode: HitMode::Stream,
                })
                .inc();

            let mut out = replay_stored_headers(&result.meta);
            out.insert(API_VERSION_HEADER, API_VERSION_VALUE);
            set_cache_control(&mut out, info);

            return match result.body {
                // Seekable body (filesystem) — full Range negotiation.
                CacheBody::Seekable(body) => range::serve_seekable(headers, out, body).await,
                // Non-seekable stream — serve the full body.
                CacheBody::Streaming(body) => response_with(
                    StatusCode::OK,
                    out,
                    Body::from_stream(ReaderStream::new(body)),
                ),
            };
        }

        metrics.cache_misses_total.inc();
    }

    // 3. Cache miss or uncacheable — fetch from upstream.
    info!(
        image = %info.image(),
        kind = %info.kind,
        reference = %info.short_ref(),
        "upstream fetch"
    );
    metrics.upstream_requests_total.inc();

    let resp = match state.upstream.execute(Method::GET, headers, info).await {
        Ok(resp) => resp,
        Err(err) => {
            error!(image = %info.image(), error = %err, "upstream failed");
            return plain_error(StatusCode::BAD_GATEWAY, "upstream error");
        }
    };

    // Non-200 responses (401, 404, 429, ...) — forward as-is, never cache.
    if resp.status() != StatusCode::OK {
        debug!(image = %info.image(), status = %resp.status(), "upstream non-200");
        let mut out = copy_response_headers(resp.headers());
        out.insert(API_VERSION_HEADER, API_VERSION_VALUE);
        let status = resp.status();
        return response_with(status, out, Body::from_stream(resp.bytes_stream()));
    }

    // 200 OK — uncacheable responses forward directly, everything else
    // tee-streams into the store.
    let mut out = copy_response_headers(resp.headers());
    out.insert(API_VERSION_HEADER, API_VERSION_VALUE);

    if !cacheable {
        return response_with(
            StatusCode::OK,
            out,
            Body::from_stream(resp.bytes_stream()),
        );
    }

    set_cache_control(&mut out, info);

    let put_meta = ObjectMeta {
        content_type: header_value_str(resp.headers(), header::CONTENT_TYPE.as_str()),
        docker_content_digest: header_value_str(resp.headers(), "docker-content-digest"),
        content_length: resp
            .content_length()
            .map(|len| len as i64)
            .unwrap_or(-1),
        header: Some(copy_response_headers(resp.headers())),
    };

    let body = tee_to_store(
        Box::pin(resp.bytes_stream()),
        state.store.clone(),
        key.to_string(),
        put_meta,
    );

    response_with(StatusCode::OK, out, body)
}

// ---------------------------------------------------------------------------
// Header plumbing
// ---------------------------------------------------------------------------

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Copy upstream response headers, dropping hop-by-hop headers. Used both
/// for forwarding to the client and for the persisted metadata snapshot.
fn copy_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        if is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Rebuild response headers from cached metadata. Entries written by current
/// versions carry the full header map; legacy sidecars only have the scalar
/// fields, which are promoted here.
fn replay_stored_headers(meta: &ObjectMeta) -> HeaderMap {
    let mut out = HeaderMap::new();
    match &meta.header {
        Some(header) => {
            for (name, value) in header {
                out.append(name.clone(), value.clone());
            }
        }
        None => {
            if !meta.content_type.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&meta.content_type) {
                    out.insert(header::CONTENT_TYPE, value);
                }
            }
            if !meta.docker_content_digest.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&meta.docker_content_digest) {
                    out.insert(HeaderName::from_static("docker-content-digest"), value);
                }
            }
            if meta.content_length > 0 {
                if let Ok(value) = HeaderValue::from_str(&meta.content_length.to_string()) {
                    out.insert(header::CONTENT_LENGTH, value);
                }
            }
        }
    }
    out
}

/// Freshness advertised for content the cache can attest to. Content-addressed
/// artifacts never change; tag manifests can move, so they get a bounded
/// max-age, with `latest` shortest of all.
fn set_cache_control(headers: &mut HeaderMap, info: &RequestInfo) {
    let value = if info.is_tag_manifest() {
        if info.reference == "latest" {
            HeaderValue::from_static("public, max-age=3600")
        } else {
            HeaderValue::from_static("public, max-age=2419200")
        }
    } else {
        HeaderValue::from_static("public, max-age=31536000, immutable")
    };
    headers.insert(header::CACHE_CONTROL, value);
}

fn header_value_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// ---------------------------------------------------------------------------
// Error shaping
// ---------------------------------------------------------------------------

/// Plain-text error with the OCI version header.
fn plain_error(status: StatusCode, message: &str) -> Response {
    let mut out = HeaderMap::new();
    out.insert(API_VERSION_HEADER, API_VERSION_VALUE);
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response_with(status, out, Body::from(format!("{message}\n")))
}

/// OCI-compliant JSON error response.
fn oci_error(status: StatusCode, code: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "errors": [{ "code": code, "message": message }],
    });
    let mut out = HeaderMap::new();
    out.insert(API_VERSION_HEADER, API_VERSION_VALUE);
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response_with(status, out, Body::from(body.to_string()))
}

fn response_with(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_tags(cache_tag_manifests: bool, cache_latest_tag: bool) -> AppState {
        AppState {
            store: Arc::new(crate::cache::fs::FsStore::new("/nonexistent")),
            upstream: UpstreamClient::new("https").unwrap(),
            mode: RegistryMode::SingleUpstream("example.com".into()),
            cache_tag_manifests,
            cache_latest_tag,
            metrics: MetricsRegistry::new(),
        }
    }

    fn manifest(reference: &str) -> RequestInfo {
        RequestInfo {
            registry: "example.com".into(),
            name: "org/image".into(),
            kind: Kind::Manifests,
            reference: reference.into(),
        }
    }

    #[test]
    fn content_addressed_requests_always_cache() {
        let state = state_with_tags(false, false);
        let blob = RequestInfo {
            kind: Kind::Blobs,
            ..manifest("sha256:abc")
        };
        assert!(state.should_cache(&blob));
        assert!(state.should_cache(&manifest("sha256:abc")));
    }

    #[test]
    fn referrers_never_cache() {
        let state = state_with_tags(true, true);
        let referrers = RequestInfo {
            kind: Kind::Referrers,
            ..manifest("sha256:abc")
        };
        assert!(!state.should_cache(&referrers));
    }

    #[test]
    fn tag_manifest_policy_gates() {
        let disabled = state_with_tags(false, false);
        assert!(!disabled.should_cache(&manifest("v1")));
        assert!(!disabled.should_cache(&manifest("latest")));

        let tags_only = state_with_tags(true, false);
        assert!(tags_only.should_cache(&manifest("v1")));
        assert!(!tags_only.should_cache(&manifest("latest")));

        let everything = state_with_tags(true, true);
        assert!(everything.should_cache(&manifest("v1")));
        assert!(everything.should_cache(&manifest("latest")));
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", "application/json".parse().unwrap());
        upstream.insert("transfer-encoding", "chunked".parse().unwrap());
        upstream.insert("connection", "keep-alive".parse().unwrap());
        upstream.append("x-multi", "a".parse().unwrap());
        upstream.append("x-multi", "b".parse().unwrap());

        let copied = copy_response_headers(&upstream);
        assert!(copied.get("transfer-encoding").is_none());
        assert!(copied.get("connection").is_none());
        assert_eq!(copied.get("content-type").unwrap(), "application/json");
        let multi: Vec<_> = copied.get_all("x-multi").iter().collect();
        assert_eq!(multi, ["a", "b"]);
    }

    #[test]
    fn legacy_meta_promotes_scalars() {
        let meta = ObjectMeta {
            content_type: "application/octet-stream".into(),
            docker_content_digest: "sha256:abc".into(),
            content_length: 16,
            header: None,
        };
        let replayed = replay_stored_headers(&meta);
        assert_eq!(
            replayed.get("content-type").unwrap(),
            "application/octet-stream"
        );
        assert_eq!(replayed.get("docker-content-digest").unwrap(), "sha256:abc");
        assert_eq!(replayed.get("content-length").unwrap(), "16");
    }

    #[test]
    fn cache_control_by_reference_kind() {
        let mut headers = HeaderMap::new();
        set_cache_control(&mut headers, &manifest("sha256:abc"));
        assert_eq!(
            headers.get("cache-control").unwrap(),
            "public, max-age=31536000, immutable"
        );

        set_cache_control(&mut headers, &manifest("latest"));
        assert_eq!(headers.get("cache-control").unwrap(), "public, max-age=3600");

        set_cache_control(&mut headers, &manifest("v1.2.3"));
        assert_eq!(
            headers.get("cache-control").unwrap(),
            "public, max-age=2419200"
        );
    }
}
