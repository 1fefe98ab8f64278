//! Object storage layer for cached OCI artifacts.
//!
//! Every cached entry is a pair of sibling objects: the opaque body at
//! `{key}` and a metadata sidecar at `{key}.meta.json`. The sidecar is the
//! authoritative presence signal — readers fetch it first, writers persist it
//! last — so a visible sidecar always implies a complete body.

pub mod fs;
pub mod s3;

use std::collections::BTreeMap;
use std::pin::Pin;

use anyhow::{Context, Result};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncSeek};

// ---------------------------------------------------------------------------
// Body types
// ---------------------------------------------------------------------------

/// Streaming reader handed to [`Store::put`].
pub type BodyReader = Pin<Box<dyn AsyncRead + Send + Sync + 'static>>;

/// A readable body that also supports random access, e.g. `tokio::fs::File`.
pub trait SeekableRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableRead for T {}

/// Body returned by [`Store::get`].
///
/// The filesystem backend yields seekable handles so the proxy can serve
/// byte ranges directly; network backends yield plain streams.
pub enum CacheBody {
    Seekable(Box<dyn SeekableRead>),
    Streaming(BodyReader),
}

/// Body and metadata from a single [`Store::get`] call.
pub struct GetResult {
    pub body: CacheBody,
    pub meta: ObjectMeta,
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Capability set every storage backend implements.
///
/// Backends must be safe under concurrent `put`/`get` on identical keys:
/// cached bodies are content-addressed, so racing writers store byte-identical
/// data and overwrites are benign.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Prepare the backend for use. Idempotent: safe to call on an
    /// already-initialised store.
    async fn init(&self) -> Result<()>;

    /// Return the metadata for `key`, or an error when the entry is absent.
    /// Presence is derived from the sidecar's existence.
    async fn head(&self, key: &str) -> Result<ObjectMeta>;

    /// Return the body and metadata for `key`. The sidecar is read first;
    /// its absence is the miss signal.
    async fn get(&self, key: &str) -> Result<GetResult>;

    /// Persist the body, then the sidecar. The body write should be atomic
    /// (tmp+rename or conditional upload) so partial bodies never become
    /// visible.
    async fn put(&self, key: &str, body: BodyReader, meta: ObjectMeta) -> Result<()>;

    /// Probe for the optional redirect capability. Backends that can issue
    /// short-lived signed URLs override this to return themselves.
    fn redirector(&self) -> Option<&dyn Redirector> {
        None
    }
}

/// Optional capability: issue a short-lived URL from which the body can be
/// fetched directly, bypassing the proxy's data path.
#[async_trait::async_trait]
pub trait Redirector: Send + Sync {
    async fn redirect_url(&self, key: &str) -> Result<(String, ObjectMeta)>;
}

// ---------------------------------------------------------------------------
// Object metadata and the sidecar codec
// ---------------------------------------------------------------------------

/// Metadata associated with every cached body.
///
/// The header map is the source of truth; the scalar fields are a
/// denormalized view for code that does not want to walk the map. Legacy
/// sidecars carry only the scalars, in which case `header` is `None` and the
/// scalars are promoted back into the response on replay.
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    pub content_type: String,
    pub docker_content_digest: String,
    pub content_length: i64,
    pub header: Option<HeaderMap>,
}

/// Legacy sidecar layout: three scalar fields, no header map.
#[derive(Debug, Serialize, Deserialize)]
struct LegacyMeta {
    content_type: String,
    docker_content_digest: String,
    content_length: i64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Sidecar {
    Headers(BTreeMap<String, Vec<String>>),
    Legacy(LegacyMeta),
}

impl ObjectMeta {
    /// Serialize the metadata to its sidecar byte form. Only the header map
    /// is persisted; the scalar fields are re-derived from it on read.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let map: BTreeMap<String, Vec<String>> = match &self.header {
            Some(header) => {
                let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for (name, value) in header {
                    map.entry(canonical_header_name(name.as_str()))
                        .or_default()
                        .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
                }
                map
            }
            None => BTreeMap::new(),
        };
        serde_json::to_vec(&map).context("serializing meta sidecar")
    }

    /// Parse sidecar bytes back into metadata. Accepts both the header-map
    /// form and the legacy three-field form.
    pub fn unmarshal(data: &[u8]) -> Result<ObjectMeta> {
        let sidecar: Sidecar = serde_json::from_slice(data).context("parsing meta sidecar")?;
        match sidecar {
            Sidecar::Headers(map) => {
                let mut header = HeaderMap::new();
                for (name, values) in &map {
                    let name: HeaderName = name
                        .parse()
                        .with_context(|| format!("header name {name:?}"))?;
                    for value in values {
                        let value = HeaderValue::from_str(value)
                            .with_context(|| format!("header value for {name}"))?;
                        header.append(name.clone(), value);
                    }
                }
                let content_length = header
                    .get("content-length")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                Ok(ObjectMeta {
                    content_type: header_str(&header, "content-type"),
                    docker_content_digest: header_str(&header, "docker-content-digest"),
                    content_length,
                    header: Some(header),
                })
            }
            Sidecar::Legacy(legacy) => Ok(ObjectMeta {
                content_type: legacy.content_type,
                docker_content_digest: legacy.docker_content_digest,
                content_length: legacy.content_length,
                header: None,
            }),
        }
    }
}

fn header_str(header: &HeaderMap, name: &str) -> String {
    header
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Render a header name in its canonical form (`content-type` →
/// `Content-Type`) for the sidecar, matching what registries put on the wire.
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

// ---------------------------------------------------------------------------
// Digest normalization
// ---------------------------------------------------------------------------

/// Restore a digest to the standard `algorithm:hex` form.
///
/// Some object stores mangle colons to hyphens in metadata values, so
/// `sha256:abc…` comes back as `sha256-abc…`. The hyphen form is also what
/// storage keys use.
pub fn normalize_digest(s: &str) -> String {
    if s.contains(':') {
        return s.to_string();
    }
    for alg in ["sha256", "sha512"] {
        if let Some(hex) = s.strip_prefix(alg) {
            if let Some(hex) = hex.strip_prefix('-') {
                return format!("{alg}:{hex}");
            }
        }
    }
    s.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_digest_restores_colon() {
        assert_eq!(normalize_digest("sha256-abc123"), "sha256:abc123");
        assert_eq!(normalize_digest("sha512-def456"), "sha512:def456");
    }

    #[test]
    fn normalize_digest_leaves_wellformed_input() {
        assert_eq!(normalize_digest("sha256:abc123"), "sha256:abc123");
        assert_eq!(normalize_digest("v1.2.3"), "v1.2.3");
        assert_eq!(normalize_digest("sha256abc"), "sha256abc");
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(
            canonical_header_name("docker-content-digest"),
            "Docker-Content-Digest"
        );
        assert_eq!(canonical_header_name("etag"), "Etag");
    }

    #[test]
    fn sidecar_round_trip() {
        let mut header = HeaderMap::new();
        header.insert("content-type", "application/octet-stream".parse().unwrap());
        header.insert("content-length", "16".parse().unwrap());
        header.insert("docker-content-digest", "sha256:abc".parse().unwrap());
        header.append("x-multi", "one".parse().unwrap());
        header.append("x-multi", "two".parse().unwrap());

        let meta = ObjectMeta {
            content_type: "application/octet-stream".into(),
            docker_content_digest: "sha256:abc".into(),
            content_length: 16,
            header: Some(header),
        };

        let data = meta.marshal().unwrap();
        let parsed = ObjectMeta::unmarshal(&data).unwrap();

        assert_eq!(parsed.content_type, "application/octet-stream");
        assert_eq!(parsed.docker_content_digest, "sha256:abc");
        assert_eq!(parsed.content_length, 16);
        let header = parsed.header.unwrap();
        let multi: Vec<_> = header.get_all("x-multi").iter().collect();
        assert_eq!(multi, ["one", "two"]);
    }

    #[test]
    fn sidecar_canonicalizes_names() {
        let mut header = HeaderMap::new();
        header.insert("content-type", "application/json".parse().unwrap());
        let meta = ObjectMeta {
            header: Some(header),
            ..Default::default()
        };
        let data = meta.marshal().unwrap();
        let text = String::from_utf8(data).unwrap();
        assert!(text.contains("\"Content-Type\""), "sidecar: {text}");
    }

    #[test]
    fn sidecar_accepts_legacy_form() {
        let data = br#"{"content_type":"application/json","docker_content_digest":"sha256:aa","content_length":42}"#;
        let meta = ObjectMeta::unmarshal(data).unwrap();
        assert_eq!(meta.content_type, "application/json");
        assert_eq!(meta.docker_content_digest, "sha256:aa");
        assert_eq!(meta.content_length, 42);
        assert!(meta.header.is_none());
    }
}
