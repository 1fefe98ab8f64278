//! Environment-variable configuration.
//!
//! Deployment is container-first: every knob is an environment variable with
//! a sensible default. AWS credentials, region, and endpoint are read by the
//! SDK's default chain (`AWS_ACCESS_KEY_ID`, `AWS_REGION`, `AWS_ENDPOINT_URL`,
//! instance profiles, ...) and do not appear here.

use anyhow::{bail, Context, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Fs,
}

/// Parsed `UPSTREAM_REGISTRY` target. Setting it selects single-upstream
/// mode; leaving it unset selects registry-in-path mode.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    /// `http` or `https`.
    pub scheme: String,
    /// Host with optional port, e.g. `ghcr.io` or `localhost:5000`.
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream: Option<UpstreamTarget>,
    pub storage_backend: StorageBackend,
    pub fs_root: String,
    pub listen_addr: String,
    pub s3_bucket: String,
    pub s3_prefix: String,
    pub s3_force_path_style: bool,
    pub s3_lifecycle_days: i32,
    pub cache_tag_manifests: bool,
    pub cache_latest_tag: bool,
    pub generate_self_signed_tls: bool,
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from the process environment.
pub fn load() -> Result<Config> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a [`Config`] from an arbitrary variable source.
fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let get = |key: &str, fallback: &str| -> String {
        match lookup(key) {
            Some(value) if !value.is_empty() => value,
            _ => fallback.to_string(),
        }
    };

    let generate_self_signed_tls = parse_bool(&get("GENERATE_SELF_SIGNED_TLS", "false"))
        .context("GENERATE_SELF_SIGNED_TLS")?;
    let default_addr = if generate_self_signed_tls {
        ":8443"
    } else {
        ":8080"
    };

    let storage_backend = match get("STORAGE_BACKEND", "s3").as_str() {
        "s3" => StorageBackend::S3,
        "fs" => StorageBackend::Fs,
        other => bail!("unknown storage backend {other:?} (expected \"s3\" or \"fs\")"),
    };

    let upstream = match lookup("UPSTREAM_REGISTRY") {
        Some(raw) if !raw.is_empty() => Some(parse_upstream(&raw)?),
        _ => None,
    };

    let log_level = get("LOG_LEVEL", "info").to_lowercase();
    if !matches!(log_level.as_str(), "debug" | "info" | "warn" | "error") {
        bail!("LOG_LEVEL must be one of debug, info, warn, error");
    }

    let s3_lifecycle_days: i32 = get("S3_LIFECYCLE_DAYS", "28")
        .parse()
        .context("S3_LIFECYCLE_DAYS must be an integer")?;

    Ok(Config {
        upstream,
        storage_backend,
        fs_root: get("FS_ROOT", "/data/oci-cache"),
        listen_addr: get("LISTEN_ADDR", default_addr),
        s3_bucket: get("S3_BUCKET", "oci-cache"),
        s3_prefix: lookup("S3_PREFIX").unwrap_or_default(),
        s3_force_path_style: parse_bool(&get("S3_FORCE_PATH_STYLE", "true"))
            .context("S3_FORCE_PATH_STYLE")?,
        s3_lifecycle_days,
        cache_tag_manifests: parse_bool(&get("CACHE_TAG_MANIFESTS", "true"))
            .context("CACHE_TAG_MANIFESTS")?,
        cache_latest_tag: parse_bool(&get("CACHE_LATEST_TAG", "false"))
            .context("CACHE_LATEST_TAG")?,
        generate_self_signed_tls,
        log_level,
    })
}

/// Parse `UPSTREAM_REGISTRY` (`https://ghcr.io`, `http://localhost:5000`).
fn parse_upstream(raw: &str) -> Result<UpstreamTarget> {
    let url: reqwest::Url = raw
        .parse()
        .with_context(|| format!("UPSTREAM_REGISTRY {raw:?} is not a valid URL"))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        bail!("UPSTREAM_REGISTRY scheme must be http or https, got {scheme:?}");
    }

    let host = url
        .host_str()
        .with_context(|| format!("UPSTREAM_REGISTRY {raw:?} has no host"))?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    Ok(UpstreamTarget {
        scheme: scheme.to_string(),
        host,
    })
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("expected a boolean, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_with(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load_with(&[]).unwrap();
        assert!(config.upstream.is_none());
        assert_eq!(config.storage_backend, StorageBackend::S3);
        assert_eq!(config.listen_addr, ":8080");
        assert_eq!(config.s3_bucket, "oci-cache");
        assert_eq!(config.s3_lifecycle_days, 28);
        assert!(config.cache_tag_manifests);
        assert!(!config.cache_latest_tag);
        assert!(config.s3_force_path_style);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn tls_moves_default_listen_addr() {
        let config = load_with(&[("GENERATE_SELF_SIGNED_TLS", "true")]).unwrap();
        assert_eq!(config.listen_addr, ":8443");

        let config = load_with(&[
            ("GENERATE_SELF_SIGNED_TLS", "true"),
            ("LISTEN_ADDR", ":9000"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr, ":9000");
    }

    #[test]
    fn upstream_registry_parses_scheme_and_port() {
        let config = load_with(&[("UPSTREAM_REGISTRY", "http://localhost:5000")]).unwrap();
        let upstream = config.upstream.unwrap();
        assert_eq!(upstream.scheme, "http");
        assert_eq!(upstream.host, "localhost:5000");

        let config = load_with(&[("UPSTREAM_REGISTRY", "https://ghcr.io")]).unwrap();
        let upstream = config.upstream.unwrap();
        assert_eq!(upstream.scheme, "https");
        assert_eq!(upstream.host, "ghcr.io");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(load_with(&[("STORAGE_BACKEND", "nfs")]).is_err());
        assert!(load_with(&[("UPSTREAM_REGISTRY", "ftp://host")]).is_err());
        assert!(load_with(&[("LOG_LEVEL", "verbose")]).is_err());
        assert!(load_with(&[("CACHE_LATEST_TAG", "maybe")]).is_err());
    }
}
