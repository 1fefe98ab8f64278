//! Tee-stream engine: fan one upstream body out to the client and the cache.
//!
//! The client copy always wins. Store-side failures latch a silent sink and
//! are never visible on the client stream; a client disconnect stops the
//! upstream read but never cancels an upload that has already begun. The
//! client-visible stream is held open until the store worker has finished,
//! so no cache write ever outlives its request.
//!
//! The flow:
//!
//! ```text
//! upstream body ─→ driver task ─→ client channel ─→ response body
//!                      │
//!                      └→ SilentSink ─→ store channel ─→ StreamReader ─→ store.put
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::cache::{ObjectMeta, Store};

/// Stream `src` to the returned [`Body`] while uploading the same bytes to
/// the store under `key`. Caching is best-effort: if the upload fails the
/// client still receives every byte uninterrupted.
pub fn tee_to_store<S, E>(src: S, store: Arc<dyn Store>, key: String, meta: ObjectMeta) -> Body
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let (client_tx, client_rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);
    let (store_tx, store_rx) = mpsc::channel::<io::Result<Bytes>>(1);

    // The uploader owns the receiving end. If `put` bails out early its
    // reader is dropped, the channel closes, and the sink latches — writes
    // from the driver never block on a dead uploader.
    let upload_key = key.clone();
    let upload = tokio::spawn(async move {
        let reader = StreamReader::new(ReceiverStream::new(store_rx));
        match store.put(&upload_key, Box::pin(reader), meta).await {
            Ok(()) => debug!(key = %upload_key, "cached"),
            Err(err) => debug!(key = %upload_key, error = %err, "cache upload failed"),
        }
    });

    tokio::spawn(async move {
        let sink = SilentSink::new(store_tx);
        let mut src = src;

        while let Some(chunk) = src.next().await {
            match chunk {
                Ok(bytes) => {
                    sink.send(bytes.clone()).await;
                    if client_tx.send(Ok(bytes)).await.is_err() {
                        // Client went away; stop reading upstream. The
                        // uploader keeps whatever it already received.
                        debug!(key = %key, "client disconnected mid-stream");
                        break;
                    }
                }
                Err(err) => {
                    // Upstream died mid-body. The client response is
                    // truncated; the short store body aborts the upload.
                    debug!(key = %key, error = %err, "upstream read failed mid-stream");
                    let _ = client_tx.send(Err(io::Error::other(err))).await;
                    break;
                }
            }
        }

        // Signal EOF to the uploader and wait for it before completing the
        // client stream: synchronous teardown, no stray cache writes.
        drop(sink);
        if let Err(err) = upload.await {
            debug!(key = %key, error = %err, "cache upload task panicked");
        }
        drop(client_tx);
    });

    Body::from_stream(ReceiverStream::new(client_rx))
}

/// Write side of the store pipe. The first failed send latches `failed`;
/// every later chunk is swallowed without touching the channel, so the
/// client copy never observes a store-side error.
struct SilentSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
    failed: AtomicBool,
}

impl SilentSink {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            failed: AtomicBool::new(false),
        }
    }

    async fn send(&self, chunk: Bytes) {
        if self.failed.load(Ordering::Relaxed) {
            return;
        }
        if self.tx.send(Ok(chunk)).await.is_err() {
            self.failed.store(true, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
