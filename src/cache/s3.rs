//! S3-compatible storage backend.
//!
//! Bodies and sidecars are sibling objects under an optional key prefix.
//! Body uploads use a conditional PUT (`If-None-Match: *`) with retries
//! disabled: when two writers race on a content-addressed key the loser gets
//! a 412/409, which is translated into success because the winning object is
//! byte-identical. Supports presigned GET URLs so the proxy can redirect
//! clients straight to the bucket.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, ExpirationStatus, LifecycleExpiration, LifecycleRule,
    LifecycleRuleFilter,
};
use aws_sdk_s3::Client;
use aws_smithy_types::body::SdkBody;
use futures::TryStreamExt;
use http_body_util::StreamBody;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::{BodyReader, CacheBody, GetResult, ObjectMeta, Redirector, Store};

const PRESIGN_TTL: Duration = Duration::from_secs(15 * 60);

/// S3-backed cache store.
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
    lifecycle_days: i32,
}

impl S3Store {
    /// Create a store from an already-configured [`Client`]. Credentials,
    /// region, and endpoint come from the SDK's default chain.
    pub fn new(client: Client, bucket: String, prefix: String, lifecycle_days: i32) -> Self {
        // Normalize the prefix so keys become "prefix/blobs/..." rather
        // than "prefixblobs/...".
        let prefix = if prefix.is_empty() {
            prefix
        } else {
            format!("{}/", prefix.trim_end_matches('/'))
        };
        Self {
            client,
            bucket,
            prefix,
            lifecycle_days,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn meta_key(&self, key: &str) -> String {
        format!("{}.meta.json", self.full_key(key))
    }

    async fn read_meta(&self, key: &str) -> Result<ObjectMeta> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.meta_key(key))
            .send()
            .await?;

        let data = out
            .body
            .collect()
            .await
            .context("reading meta sidecar")?
            .into_bytes();

        ObjectMeta::unmarshal(&data)
    }
}

#[async_trait::async_trait]
impl Store for S3Store {
    /// Create the bucket if it does not already exist and apply the
    /// lifecycle expiry rule for cached entries.
    async fn init(&self) -> Result<()> {
        if let Err(err) = self
            .client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
        {
            let service = err.into_service_error();
            if service.is_bucket_already_owned_by_you() || service.is_bucket_already_exists() {
                debug!(bucket = %self.bucket, "bucket already exists");
            } else {
                return Err(anyhow!(service)).context("creating bucket");
            }
        } else {
            debug!(bucket = %self.bucket, "bucket created");
        }

        if self.lifecycle_days > 0 {
            let rule = LifecycleRule::builder()
                .id("oci-cache-expiry")
                .status(ExpirationStatus::Enabled)
                .filter(
                    LifecycleRuleFilter::builder()
                        .prefix(&self.prefix)
                        .build(),
                )
                .expiration(
                    LifecycleExpiration::builder()
                        .days(self.lifecycle_days)
                        .build(),
                )
                .build()
                .context("building lifecycle rule")?;

            self.client
                .put_bucket_lifecycle_configuration()
                .bucket(&self.bucket)
                .lifecycle_configuration(
                    BucketLifecycleConfiguration::builder()
                        .rules(rule)
                        .build()
                        .context("building lifecycle configuration")?,
                )
                .send()
                .await
                .context("setting bucket lifecycle policy")?;

            info!(
                bucket = %self.bucket,
                expiry_days = self.lifecycle_days,
                "bucket lifecycle policy applied"
            );
        }

        Ok(())
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        self.read_meta(key).await
    }

    async fn get(&self, key: &str) -> Result<GetResult> {
        let meta = self.read_meta(key).await?;

        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await?;

        Ok(GetResult {
            body: CacheBody::Streaming(Box::pin(out.body.into_async_read())),
            meta,
        })
    }

    async fn put(&self, key: &str, body: BodyReader, meta: ObjectMeta) -> Result<()> {
        let stream = ReaderStream::new(body).map_ok(http_body::Frame::data);
        let byte_stream = ByteStream::new(SdkBody::from_body_1_x(StreamBody::new(stream)));

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(byte_stream)
            .if_none_match("*");

        if meta.content_length > 0 {
            request = request.content_length(meta.content_length);
        }
        if !meta.content_type.is_empty() {
            request = request.content_type(&meta.content_type);
        }

        // Retries stay off: the streaming body is not replayable, and a
        // conditional-PUT loser must not re-upload.
        let result = request
            .customize()
            .config_override(
                aws_sdk_s3::config::Config::builder().retry_config(RetryConfig::disabled()),
            )
            .send()
            .await;

        if let Err(err) = result {
            if is_conditional_put_conflict(&err) {
                debug!(key, "object already cached, skipping duplicate upload");
                return Ok(());
            }
            return Err(anyhow!(err)).context("putting data to S3");
        }

        let sidecar = meta.marshal()?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.meta_key(key))
            .body(ByteStream::from(sidecar))
            .content_type("application/json")
            .send()
            .await
            .context("putting meta sidecar to S3")?;

        debug!(key, "stored");
        Ok(())
    }

    fn redirector(&self) -> Option<&dyn Redirector> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Redirector for S3Store {
    /// Presign a GET for the body object and return it with the metadata.
    async fn redirect_url(&self, key: &str) -> Result<(String, ObjectMeta)> {
        let meta = self.read_meta(key).await?;

        let presigning = PresigningConfig::builder()
            .expires_in(PRESIGN_TTL)
            .build()
            .context("building presigning config")?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .presigned(presigning)
            .await
            .context("presigning GetObject")?;

        Ok((presigned.uri().to_string(), meta))
    }
}

/// True when the PutObject error is the 412/409 a conditional PUT returns
/// for an already-present key.
fn is_conditional_put_conflict(err: &SdkError<PutObjectError>) -> bool {
    matches!(
        err.raw_response().map(|r| r.status().as_u16()),
        Some(412) | Some(409)
    )
}
