//! Self-signed TLS for the `GENERATE_SELF_SIGNED_TLS` opt-in.
//!
//! Intended for lab and air-gapped deployments where clients are configured
//! to trust (or skip verifying) the proxy; production deployments terminate
//! TLS in front of the proxy instead.

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;

/// Generate an in-memory self-signed certificate and wrap it for the server.
pub async fn self_signed_config() -> Result<RustlsConfig> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "ocicache".to_string()])
            .context("generating self-signed certificate")?;

    RustlsConfig::from_pem(
        cert.pem().into_bytes(),
        key_pair.serialize_pem().into_bytes(),
    )
    .await
    .context("building rustls server config")
}
