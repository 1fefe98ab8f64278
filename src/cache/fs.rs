//! Filesystem storage backend.
//!
//! Bodies live at `{root}/{key}` with sidecars at `{root}/{key}.meta.json`.
//! Writes go through a temp file in the destination directory followed by a
//! rename, so readers never observe a partially-written object. Reads hand
//! back the open `tokio::fs::File`, which is seekable and therefore enables
//! range serving in the proxy.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{BodyReader, CacheBody, GetResult, ObjectMeta, Store};

/// Filesystem-backed cache store rooted at a single directory.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn data_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        path
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        let mut path = self.data_path(key).into_os_string();
        path.push(".meta.json");
        PathBuf::from(path)
    }

    async fn read_meta(&self, key: &str) -> Result<ObjectMeta> {
        let data = fs::read(self.meta_path(key)).await?;
        ObjectMeta::unmarshal(&data)
    }
}

#[async_trait::async_trait]
impl Store for FsStore {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating cache root {}", self.root.display()))
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        self.read_meta(key).await
    }

    async fn get(&self, key: &str) -> Result<GetResult> {
        let meta = self.read_meta(key).await?;
        let file = fs::File::open(self.data_path(key)).await?;
        Ok(GetResult {
            body: CacheBody::Seekable(Box::new(file)),
            meta,
        })
    }

    async fn put(&self, key: &str, mut body: BodyReader, meta: ObjectMeta) -> Result<()> {
        let data_path = self.data_path(key);
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        atomic_write(&data_path, &mut body)
            .await
            .context("writing data")?;

        let sidecar = meta.marshal()?;
        atomic_write(&self.meta_path(key), &mut sidecar.as_slice())
            .await
            .context("writing metadata")?;

        debug!(key, "stored");
        Ok(())
    }
}

/// Write a stream to `dst` via a temp file in the same directory, then
/// rename into place. The rename keeps partially-written bodies invisible.
async fn atomic_write<R>(dst: &Path, body: &mut R) -> Result<()>
where
    R: tokio::io::AsyncRead + Send + Unpin + ?Sized,
{
    // Unique per write so concurrent puts of the same key never share a
    // temp file; the final rename makes the last writer win.
    static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let dir = dst.parent().context("destination has no parent")?;
    let tmp = dir.join(format!(".tmp-{}-{seq}", std::process::id()));

    let mut file = fs::File::create(&tmp)
        .await
        .with_context(|| format!("creating temp file {}", tmp.display()))?;

    let result: Result<()> = async {
        tokio::io::copy(body, &mut file).await?;
        file.flush().await?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        drop(file);
        let _ = fs::remove_file(&tmp).await;
        return Err(err);
    }

    fs::rename(&tmp, dst)
        .await
        .with_context(|| format!("renaming into {}", dst.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    fn meta_with_headers() -> ObjectMeta {
        let mut header = HeaderMap::new();
        header.insert("content-type", "application/octet-stream".parse().unwrap());
        header.insert("content-length", "5".parse().unwrap());
        ObjectMeta {
            content_type: "application/octet-stream".into(),
            docker_content_digest: String::new(),
            content_length: 5,
            header: Some(header),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.init().await.unwrap();

        let body: BodyReader = Box::pin(&b"hello"[..]);
        store
            .put("blobs/sha256-aa", body, meta_with_headers())
            .await
            .unwrap();

        let result = store.get("blobs/sha256-aa").await.unwrap();
        assert_eq!(result.meta.content_type, "application/octet-stream");

        let mut contents = Vec::new();
        match result.body {
            CacheBody::Seekable(mut file) => {
                file.read_to_end(&mut contents).await.unwrap();
            }
            CacheBody::Streaming(_) => panic!("fs store must return a seekable body"),
        }
        assert_eq!(contents, b"hello");
    }

    #[tokio::test]
    async fn seekable_body_supports_random_access() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.init().await.unwrap();

        let body: BodyReader = Box::pin(&b"0123456789"[..]);
        store
            .put("blobs/sha256-bb", body, meta_with_headers())
            .await
            .unwrap();

        let CacheBody::Seekable(mut file) = store.get("blobs/sha256-bb").await.unwrap().body
        else {
            panic!("expected seekable body");
        };
        file.seek(std::io::SeekFrom::Start(5)).await.unwrap();
        let mut tail = String::new();
        file.read_to_string(&mut tail).await.unwrap();
        assert_eq!(tail, "56789");
    }

    #[tokio::test]
    async fn head_misses_without_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.init().await.unwrap();

        // A body without a sidecar is not an entry.
        fs::create_dir_all(dir.path().join("blobs")).await.unwrap();
        fs::write(dir.path().join("blobs/sha256-cc"), b"orphan")
            .await
            .unwrap();

        assert!(store.head("blobs/sha256-cc").await.is_err());
        assert!(store.get("blobs/sha256-cc").await.is_err());
    }

    #[tokio::test]
    async fn head_reads_legacy_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.init().await.unwrap();

        fs::create_dir_all(dir.path().join("blobs")).await.unwrap();
        fs::write(dir.path().join("blobs/sha256-dd"), b"data")
            .await
            .unwrap();
        fs::write(
            dir.path().join("blobs/sha256-dd.meta.json"),
            br#"{"content_type":"application/json","docker_content_digest":"sha256:dd","content_length":4}"#,
        )
        .await
        .unwrap();

        let meta = store.head("blobs/sha256-dd").await.unwrap();
        assert_eq!(meta.content_type, "application/json");
        assert_eq!(meta.content_length, 4);
        assert!(meta.header.is_none());
    }
}
