//! Range-aware serving of seekable cached bodies.
//!
//! A cache hit whose body supports random access (the filesystem backend's
//! file handles) gets real byte-range semantics: a satisfiable single range
//! yields `206 Partial Content` with `Content-Range`, an unsatisfiable one
//! yields `416`, anything else the full `200` body. Cached entries have no
//! meaningful modification time, so time-based `If-Range` validators never
//! match; only a strong `ETag` equal to the stored one revalidates a range.

use std::io::SeekFrom;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::cache::SeekableRead;

/// A single parsed byte range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

enum RangeOutcome {
    /// No (usable) range requested; serve the whole body.
    Full,
    /// One satisfiable range.
    Partial(ByteRange),
    /// Range syntax was valid but nothing overlaps the body.
    Unsatisfiable,
}

/// Serve a seekable cached body, honouring `Range`/`If-Range`.
///
/// `response_headers` is the already-replayed header set (stored headers
/// plus proxy additions); `Content-Length` and `Content-Range` are
/// overwritten here to match what is actually sent.
pub async fn serve_seekable(
    request_headers: &HeaderMap,
    mut response_headers: HeaderMap,
    mut body: Box<dyn SeekableRead>,
) -> Response {
    let size = match body.seek(SeekFrom::End(0)).await {
        Ok(size) => size,
        Err(err) => {
            debug!(error = %err, "cached body size discovery failed");
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "cache read error");
        }
    };

    let outcome = evaluate_range(request_headers, response_headers.get(header::ETAG), size);

    match outcome {
        RangeOutcome::Unsatisfiable => {
            let message = "invalid range";
            response_headers.insert(header::CONTENT_RANGE, content_range_unsatisfiable(size));
            response_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            response_headers.insert(header::CONTENT_LENGTH, header_u64(message.len() as u64));
            build_response(
                StatusCode::RANGE_NOT_SATISFIABLE,
                response_headers,
                Body::from(message),
            )
        }
        RangeOutcome::Partial(range) => {
            if let Err(err) = body.seek(SeekFrom::Start(range.start)).await {
                debug!(error = %err, "cached body seek failed");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "cache read error");
            }
            response_headers.insert(header::CONTENT_LENGTH, header_u64(range.len()));
            response_headers.insert(
                header::CONTENT_RANGE,
                content_range(range, size),
            );
            build_response(
                StatusCode::PARTIAL_CONTENT,
                response_headers,
                Body::from_stream(ReaderStream::new(body.take(range.len()))),
            )
        }
        RangeOutcome::Full => {
            if let Err(err) = body.seek(SeekFrom::Start(0)).await {
                debug!(error = %err, "cached body rewind failed");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "cache read error");
            }
            response_headers.insert(header::CONTENT_LENGTH, header_u64(size));
            build_response(
                StatusCode::OK,
                response_headers,
                Body::from_stream(ReaderStream::new(body)),
            )
        }
    }
}

fn evaluate_range(
    request_headers: &HeaderMap,
    etag: Option<&HeaderValue>,
    size: u64,
) -> RangeOutcome {
    let Some(range_header) = request_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
    else {
        return RangeOutcome::Full;
    };

    // If-Range: serve the full body unless the validator is a strong ETag
    // matching the stored one. Dates never match (zero modification time).
    if let Some(if_range) = request_headers
        .get(header::IF_RANGE)
        .and_then(|v| v.to_str().ok())
    {
        let matches = if_range.starts_with('"')
            && etag
                .and_then(|v| v.to_str().ok())
                .is_some_and(|stored| stored == if_range);
        if !matches {
            return RangeOutcome::Full;
        }
    }

    parse_range(range_header, size)
}

/// Parse a `bytes=` range specifier against a body of `size` bytes.
///
/// Only single ranges are honoured; multi-range requests fall back to the
/// full body rather than synthesizing multipart/byteranges.
fn parse_range(header: &str, size: u64) -> RangeOutcome {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return RangeOutcome::Unsatisfiable;
    };
    if spec.contains(',') {
        return RangeOutcome::Full;
    }

    let Some((start, end)) = spec.split_once('-') else {
        return RangeOutcome::Unsatisfiable;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // Suffix form: last N bytes.
        let Ok(suffix) = end.parse::<u64>() else {
            return RangeOutcome::Unsatisfiable;
        };
        if suffix == 0 || size == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let len = suffix.min(size);
        return RangeOutcome::Partial(ByteRange {
            start: size - len,
            end: size - 1,
        });
    }

    let Ok(start) = start.parse::<u64>() else {
        return RangeOutcome::Unsatisfiable;
    };
    if start >= size {
        return RangeOutcome::Unsatisfiable;
    }

    let end = if end.is_empty() {
        size - 1
    } else {
        match end.parse::<u64>() {
            Ok(end) if end >= start => end.min(size - 1),
            _ => return RangeOutcome::Unsatisfiable,
        }
    };

    RangeOutcome::Partial(ByteRange { start, end })
}

fn content_range(range: ByteRange, size: u64) -> HeaderValue {
    HeaderValue::from_str(&format!("bytes {}-{}/{}", range.start, range.end, size))
        .unwrap_or_else(|_| HeaderValue::from_static("bytes */0"))
}

fn content_range_unsatisfiable(size: u64) -> HeaderValue {
    HeaderValue::from_str(&format!("bytes */{size}"))
        .unwrap_or_else(|_| HeaderValue::from_static("bytes */0"))
}

fn header_u64(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn plain_response(status: StatusCode, message: &str) -> Response {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const BLOB: &[u8] = b"0123456789ABCDEF";

    fn request_with_range(range: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, range.parse().unwrap());
        headers
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .into()
    }

    fn seekable() -> Box<dyn SeekableRead> {
        Box::new(Cursor::new(BLOB.to_vec()))
    }

    #[tokio::test]
    async fn plain_get_serves_full_body() {
        let response = serve_seekable(&HeaderMap::new(), HeaderMap::new(), seekable()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            "16"
        );
        assert_eq!(body_bytes(response).await, BLOB);
    }

    #[tokio::test]
    async fn satisfiable_range_serves_partial_content() {
        let response = serve_seekable(
            &request_with_range("bytes=5-9"),
            HeaderMap::new(),
            seekable(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 5-9/16"
        );
        assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(body_bytes(response).await, b"56789");
    }

    #[tokio::test]
    async fn open_ended_and_suffix_ranges() {
        let response = serve_seekable(
            &request_with_range("bytes=12-"),
            HeaderMap::new(),
            seekable(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body_bytes(response).await, b"CDEF");

        let response = serve_seekable(
            &request_with_range("bytes=-4"),
            HeaderMap::new(),
            seekable(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body_bytes(response).await, b"CDEF");
    }

    #[tokio::test]
    async fn end_past_body_is_clamped() {
        let response = serve_seekable(
            &request_with_range("bytes=10-99"),
            HeaderMap::new(),
            seekable(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 10-15/16"
        );
        assert_eq!(body_bytes(response).await, b"ABCDEF");
    }

    #[tokio::test]
    async fn unsatisfiable_range_yields_416() {
        let response = serve_seekable(
            &request_with_range("bytes=99-100"),
            HeaderMap::new(),
            seekable(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */16"
        );
    }

    #[tokio::test]
    async fn multi_range_falls_back_to_full_body() {
        let response = serve_seekable(
            &request_with_range("bytes=0-3,8-11"),
            HeaderMap::new(),
            seekable(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, BLOB);
    }

    #[tokio::test]
    async fn if_range_mismatch_serves_full_body() {
        let mut request = request_with_range("bytes=5-9");
        request.insert(header::IF_RANGE, "\"other-etag\"".parse().unwrap());

        let mut stored = HeaderMap::new();
        stored.insert(header::ETAG, "\"etag-1\"".parse().unwrap());

        let response = serve_seekable(&request, stored, seekable()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, BLOB);
    }

    #[tokio::test]
    async fn if_range_match_serves_partial() {
        let mut request = request_with_range("bytes=5-9");
        request.insert(header::IF_RANGE, "\"etag-1\"".parse().unwrap());

        let mut stored = HeaderMap::new();
        stored.insert(header::ETAG, "\"etag-1\"".parse().unwrap());

        let response = serve_seekable(&request, stored, seekable()).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body_bytes(response).await, b"56789");
    }

    #[tokio::test]
    async fn time_based_if_range_never_matches() {
        let mut request = request_with_range("bytes=5-9");
        request.insert(
            header::IF_RANGE,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );

        let response = serve_seekable(&request, HeaderMap::new(), seekable()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
