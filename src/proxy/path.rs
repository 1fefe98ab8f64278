//! OCI request path parsing and storage-key derivation.
//!
//! A `/v2/` sub-path (prefix already stripped) is decomposed into registry,
//! image name, kind, and reference. All segments before the `manifests` /
//! `blobs` / `referrers` keyword form the image name; everything after it is
//! the reference. The registry comes either from configuration
//! (single-upstream mode) or from the leading path segment
//! (registry-in-path mode).

use std::fmt;
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Result};
use regex::Regex;

use crate::cache::normalize_digest;

static REGISTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?(:[0-9]{1,5})?$")
        .expect("registry pattern is valid")
});

// ---------------------------------------------------------------------------
// Request descriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Manifests,
    Blobs,
    Referrers,
}

impl Kind {
    fn from_segment(segment: &str) -> Option<Kind> {
        match segment {
            "manifests" => Some(Kind::Manifests),
            "blobs" => Some(Kind::Blobs),
            "referrers" => Some(Kind::Referrers),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Manifests => "manifests",
            Kind::Blobs => "blobs",
            Kind::Referrers => "referrers",
        })
    }
}

/// Parsed components of an OCI registry request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// Upstream registry host, e.g. `ghcr.io`.
    pub registry: String,
    /// Repository name, possibly multi-segment, e.g. `org/image`.
    pub name: String,
    pub kind: Kind,
    /// Tag or digest.
    pub reference: String,
}

impl RequestInfo {
    /// True for a manifest addressed by tag rather than digest.
    pub fn is_tag_manifest(&self) -> bool {
        self.kind == Kind::Manifests && !self.reference.contains(':')
    }

    /// `registry/name`, for logging.
    pub fn image(&self) -> String {
        format!("{}/{}", self.registry, self.name)
    }

    /// Reference truncated for logging: tags as-is, digests as algo:first12.
    pub fn short_ref(&self) -> String {
        match self.reference.split_once(':') {
            Some((alg, hex)) if hex.len() > 12 => format!("{alg}:{}", &hex[..12]),
            _ => self.reference.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry resolution modes
// ---------------------------------------------------------------------------

/// How the upstream registry for a request is determined. Picked once at
/// startup; a process runs exactly one mode.
#[derive(Debug, Clone)]
pub enum RegistryMode {
    /// Registry injected from configuration; the whole path is
    /// name + kind + reference.
    SingleUpstream(String),
    /// First path segment names the registry.
    InPath,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a `/v2/` sub-path (prefix stripped) into a [`RequestInfo`].
pub fn parse_path(path: &str, mode: &RegistryMode) -> Result<RequestInfo> {
    let path = path.trim_start_matches('/').trim_end_matches('/');
    let mut segments: Vec<&str> = path.split('/').collect();

    let registry = match mode {
        RegistryMode::SingleUpstream(registry) => registry.clone(),
        RegistryMode::InPath => {
            let first = *segments
                .first()
                .ok_or_else(|| anyhow!("path must contain 'manifests' or 'blobs'"))?;
            if !REGISTRY_RE.is_match(first) {
                bail!("invalid registry {first:?}");
            }
            segments.remove(0);
            first.to_string()
        }
    };

    // Find the kind keyword scanning from the end, so repository names may
    // themselves contain "blobs" or "manifests" segments.
    let (kind_idx, kind) = segments
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, s)| Kind::from_segment(s).map(|k| (i, k)))
        .ok_or_else(|| anyhow!("path must contain 'manifests' or 'blobs'"))?;

    if kind_idx == 0 {
        bail!("path must include image name before {kind}");
    }
    if kind_idx + 1 >= segments.len() {
        bail!("missing reference after {kind}");
    }

    // Normalize mangled digests (sha256-hex from colon-hostile metadata
    // round-trips) back to sha256:hex.
    let reference = normalize_digest(&segments[kind_idx + 1..].join("/"));

    Ok(RequestInfo {
        registry,
        name: segments[..kind_idx].join("/"),
        kind,
        reference,
    })
}

// ---------------------------------------------------------------------------
// Storage keys
// ---------------------------------------------------------------------------

/// Compute the storage key for a request. Digest colons become hyphens
/// (`sha256:abc` → `sha256-abc`) to keep keys as single path segments that
/// survive colon-hostile backends.
pub fn storage_key(info: &RequestInfo) -> String {
    if info.kind == Kind::Blobs {
        // Blobs are content-addressed; key by digest only.
        return format!("blobs/{}", info.reference.replacen(':', "-", 1));
    }

    if info.reference.contains(':') {
        return format!(
            "manifests/{}/{}/{}",
            info.registry,
            info.name,
            info.reference.replacen(':', "-", 1)
        );
    }

    // Tag manifests: only read or written when tag caching is enabled.
    format!(
        "manifests/{}/{}/tags/{}",
        info.registry, info.name, info.reference
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
