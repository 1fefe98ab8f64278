//! HTTP client for upstream OCI registries.
//!
//! Synthesizes outbound requests from the parsed descriptor, forwarding only
//! the controlled header subset: `Authorization` (auth passthrough),
//! `Accept` (manifest content negotiation), and `Range`/`If-Range`
//! (resumable downloads). Redirects are followed automatically — upstreams
//! routinely bounce blob downloads to CDN-backed storage.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderMap, Method};
use reqwest::Response;

use super::path::RequestInfo;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_IDLE_PER_HOST: usize = 20;

const FORWARDED_REQUEST_HEADERS: [header::HeaderName; 4] = [
    header::AUTHORIZATION,
    header::ACCEPT,
    header::RANGE,
    header::IF_RANGE,
];

/// Client for upstream registries with a keep-alive connection pool.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    /// `https` by default; `http` is an explicit opt-in for plaintext
    /// upstreams.
    pub scheme: String,
}

impl UpstreamClient {
    pub fn new(scheme: impl Into<String>) -> Result<Self> {
        // Decompression stays off: registry bodies are already compressed
        // blobs, and transparent decompression would invalidate digests.
        let client = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .tcp_keepalive(Duration::from_secs(30))
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()
            .context("building upstream HTTP client")?;

        Ok(Self {
            client,
            scheme: scheme.into(),
        })
    }

    /// Forward a `/v2/` version check so auth challenges
    /// (401 + `Www-Authenticate`) flow back to the client unchanged.
    pub async fn do_v2_check(
        &self,
        method: Method,
        headers: &HeaderMap,
        registry: &str,
    ) -> Result<Response> {
        let url = format!("{}://{}/v2/", self.scheme, resolve_registry(registry));

        let mut request = self.client.request(method, url);
        if let Some(auth) = headers.get(header::AUTHORIZATION) {
            request = request.header(header::AUTHORIZATION, auth);
        }

        self.send(request).await
    }

    /// Forward a manifest/blob/referrers request to the upstream registry.
    pub async fn execute(
        &self,
        method: Method,
        headers: &HeaderMap,
        info: &RequestInfo,
    ) -> Result<Response> {
        let mut request = self.client.request(method, self.upstream_url(info));

        for name in FORWARDED_REQUEST_HEADERS {
            for value in headers.get_all(&name) {
                request = request.header(name.clone(), value);
            }
        }

        self.send(request).await
    }

    /// Forward a request with a deadline covering the entire exchange,
    /// body included. Used for the secondary referrers API, where a slow
    /// upstream must not tie up the proxy.
    pub async fn execute_bounded(
        &self,
        method: Method,
        headers: &HeaderMap,
        info: &RequestInfo,
        deadline: Duration,
    ) -> Result<Response> {
        let mut request = self
            .client
            .request(method, self.upstream_url(info))
            .timeout(deadline);

        for name in FORWARDED_REQUEST_HEADERS {
            for value in headers.get_all(&name) {
                request = request.header(name.clone(), value);
            }
        }

        request.send().await.context("upstream request failed")
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        // reqwest resolves `send()` once response headers arrive, so a
        // timeout here bounds time-to-headers without capping body size.
        tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, request.send())
            .await
            .context("upstream response headers timed out")?
            .context("upstream request failed")
    }

    fn upstream_url(&self, info: &RequestInfo) -> String {
        format!(
            "{}://{}/v2/{}/{}/{}",
            self.scheme,
            resolve_registry(&info.registry),
            info.name,
            info.kind,
            info.reference
        )
    }
}

/// Map well-known registry aliases to their API endpoints. Docker Hub pulls
/// go to a different host than the one users write.
fn resolve_registry(registry: &str) -> &str {
    if registry.eq_ignore_ascii_case("docker.io")
        || registry.eq_ignore_ascii_case("registry.docker.io")
    {
        return "registry-1.docker.io";
    }
    registry
}
