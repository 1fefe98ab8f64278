//! Read-only pull-through cache for OCI container registries.
//!
//! Sits between container clients and upstream registries speaking the OCI
//! Distribution v2 protocol. Misses are fetched from upstream while the body
//! is teed into a persistent object store; hits are served from the store —
//! streamed, range-sliced, or redirected to a presigned URL — without
//! touching the upstream.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod proxy;
pub mod stream;
pub mod tls;
