//! Resumable chunked transfer protocol.
//!
//! Upload direction: archives move to the remote backend through a
//! server-issued upload session. Chunks are sent with `Content-Range`
//! headers; a `308` acknowledges bytes and names the confirmed offset, a
//! `200/201` completes the upload. The session location is cached keyed by a
//! content fingerprint so a sync retried minutes or hours later resumes a
//! partially-sent archive instead of restarting it. Chunk sizes adapt to the
//! observed throughput and an optional token bucket caps upload bandwidth.
//!
//! Download direction is stateless: byte-range `GET`s behind the same
//! position/size contract ([`RangedReader`]).

pub mod progress;
pub mod transport;

use crate::config::TransferConfig;
use crate::source::ByteStream;
use crate::time::Clock;
use crate::utils::TokenBucket;
use crate::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use progress::ProgressTracker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use transport::{HttpTransport, Method, TransportRequest};

/// Chunks must be sent in multiples of this base unit.
pub const BASE_CHUNK_SIZE: u64 = 256 * 1024;

/// Chunks are sized to complete in about this long, so progress observers get
/// updates at a steady cadence.
const CHUNK_UPLOAD_TARGET_SECONDS: f64 = 10.0;

/// A cached in-flight upload: enough to resume after the uploading sync
/// attempt failed, was cancelled, or the process restarted the sync cycle.
#[derive(Debug, Clone)]
struct UploadSession {
    /// Serialized immutable backup metadata; identifies the same logical
    /// upload across unrelated calls.
    fingerprint: String,
    location: String,
    started_at: DateTime<Utc>,
    attempt_count: u32,
}

/// Client side of the resumable upload protocol.
///
/// Holds at most one cached session. `upload` runs one attempt to completion;
/// on transient failure the session survives inside this struct and the next
/// call probes and resumes it.
pub struct ResumableUpload {
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    config: TransferConfig,

    /// Endpoint that opens a new upload session.
    start_url: String,

    /// Base endpoint for fetching resource metadata by id.
    files_url: String,

    session: Option<UploadSession>,
    limiter: Option<TokenBucket>,
}

impl ResumableUpload {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        config: TransferConfig,
        start_url: impl Into<String>,
        files_url: impl Into<String>,
    ) -> Self {
        // A non-positive limit means unlimited.
        let limiter = config
            .upload_limit_bytes_per_second
            .filter(|limit| *limit > 0.0)
            .map(|limit| {
                // Token units are base-chunk multiples.
                let max_multiple = (config.max_chunk_bytes / BASE_CHUNK_SIZE).max(1) as f64;
                TokenBucket::new(clock.clone(), max_multiple, limit / BASE_CHUNK_SIZE as f64)
            });
        Self {
            transport,
            clock,
            config,
            start_url: start_url.into(),
            files_url: files_url.into(),
            session: None,
            limiter,
        }
    }

    /// Upload `stream`, resuming a cached session for the same metadata when
    /// one is still valid. Returns the remote resource's full metadata.
    pub async fn upload(
        &mut self,
        stream: &mut dyn ByteStream,
        metadata: &serde_json::Value,
        mime_type: &str,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let total = stream.size();
        if total == 0 {
            // The chunk protocol can't express an empty body, and no backend
            // produces zero-byte archives.
            return Err(EngineError::Logic(
                "refusing to upload an empty archive".to_string(),
            ));
        }
        let fingerprint = metadata.to_string();

        let location = match self.try_resume(&fingerprint, total, stream, progress).await? {
            Some(location) => location,
            None => {
                debug!(total, "Starting a new upload session");
                let response = self
                    .transport
                    .send(
                        TransportRequest::new(Method::POST, self.start_url.as_str())
                            .header("X-Upload-Content-Type", mime_type)
                            .header("X-Upload-Content-Length", total.to_string())
                            .json(metadata),
                    )
                    .await?;
                if !response.is_success() {
                    return Err(status_error(response.status));
                }
                let location = response
                    .header("location")
                    .ok_or_else(|| {
                        EngineError::Protocol("upload session response had no Location".to_string())
                    })?
                    .to_string();
                stream.seek(0).await?;
                progress.update(0);
                self.session = Some(UploadSession {
                    fingerprint,
                    location: location.clone(),
                    started_at: self.clock.now(),
                    attempt_count: 0,
                });
                location
            }
        };

        self.send_chunks(stream, total, &location, progress, cancel).await
    }

    /// Probe a cached session; returns its location with the stream seeked to
    /// the confirmed offset, or `None` when a fresh session is needed.
    async fn try_resume(
        &mut self,
        fingerprint: &str,
        total: u64,
        stream: &mut dyn ByteStream,
        progress: &ProgressTracker,
    ) -> Result<Option<String>> {
        let usable = match &self.session {
            Some(session) => {
                let expiration =
                    chrono::Duration::days(self.config.session_expiration_days as i64);
                session.fingerprint == fingerprint
                    && session.attempt_count < self.config.max_session_attempts
                    && self.clock.now() < session.started_at + expiration
            }
            None => false,
        };
        let location = match self.session.as_mut() {
            Some(session) if usable => {
                session.attempt_count += 1;
                session.location.clone()
            }
            _ => {
                self.session = None;
                return Ok(None);
            }
        };

        debug!("Probing a previously interrupted upload session");
        let response = self
            .transport
            .send(
                TransportRequest::new(Method::PUT, location.as_str())
                    .header("Content-Length", "0")
                    .header("Content-Range", format!("bytes */{total}")),
            )
            .await?;

        match response.status {
            308 => {
                let confirmed = match response.header("range") {
                    Some(range) => parse_range_end(range)? + 1,
                    // No Range header: nothing has landed yet.
                    None => 0,
                };
                debug!(confirmed, total, "Resuming upload at confirmed offset");
                stream.seek(confirmed).await?;
                progress.update(confirmed);
                Ok(Some(location))
            }
            status if (400..500).contains(&status) => {
                // The remote no longer recognizes the session.
                debug!(status, "Upload session rejected, starting over");
                self.session = None;
                Ok(None)
            }
            status if status >= 500 => Err(EngineError::ServerError(status)),
            status => {
                debug!(status, "Unexpected probe response, starting over");
                self.session = None;
                Ok(None)
            }
        }
    }

    async fn send_chunks(
        &mut self,
        stream: &mut dyn ByteStream,
        total: u64,
        location: &str,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let max_bytes = (self.config.max_chunk_bytes / BASE_CHUNK_SIZE).max(1) * BASE_CHUNK_SIZE;
        // Always restart from the minimum in case the last attempt died to
        // connectivity trouble.
        let mut chunk_bytes = BASE_CHUNK_SIZE;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let mut multiple = (chunk_bytes / BASE_CHUNK_SIZE).max(1);
            if let Some(limiter) = &mut self.limiter {
                // The limiter may grant fewer multiples than asked.
                let granted = limiter.consume_with_wait(1.0, multiple as f64).await;
                multiple = (granted.floor() as u64).max(1);
            }

            let start = stream.position();
            let data = stream.read_chunk((multiple * BASE_CHUNK_SIZE) as usize).await?;
            if data.is_empty() {
                self.session = None;
                return Err(EngineError::UploadTruncated);
            }
            let len = data.len() as u64;

            debug!(bytes = len, start, total, "Sending upload chunk");
            let sent_at = self.clock.monotonic();
            let response = self
                .transport
                .send(
                    TransportRequest::new(Method::PUT, location)
                        .header("Content-Length", len.to_string())
                        .header(
                            "Content-Range",
                            format!("bytes {}-{}/{}", start, start + len - 1, total),
                        )
                        .body(data),
                )
                .await?;
            let elapsed = (self.clock.monotonic() - sent_at).as_secs_f64();

            match response.status {
                200 | 201 => {
                    self.session = None;
                    progress.update(total);
                    let id = response
                        .json()?
                        .get("id")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            EngineError::Protocol(
                                "upload completion response had no resource id".to_string(),
                            )
                        })?
                        .to_string();
                    debug!(
                        id = %id,
                        speed = %progress::format_speed(progress.average_speed()),
                        "Upload complete"
                    );
                    let resource = self
                        .transport
                        .send(TransportRequest::new(
                            Method::GET,
                            format!("{}/{}", self.files_url, id),
                        ))
                        .await?;
                    if !resource.is_success() {
                        return Err(status_error(resource.status));
                    }
                    return resource.json();
                }
                308 => {
                    let range = response.header("range").ok_or_else(|| {
                        EngineError::Protocol(
                            "chunk acknowledgment had no Range header".to_string(),
                        )
                    })?;
                    let confirmed = parse_range_end(range)? + 1;
                    stream.seek(confirmed).await?;
                    progress.update(confirmed);
                    // A landed chunk means the connection works; give a flaky
                    // link its retry budget back.
                    if let Some(session) = self.session.as_mut() {
                        session.attempt_count = 1;
                    }
                    chunk_bytes = next_chunk_size(len, elapsed, max_bytes);
                }
                404 => {
                    self.session = None;
                    return Err(EngineError::SessionExpired);
                }
                status if (400..500).contains(&status) => {
                    // A 4xx means the session is no good anymore.
                    self.session = None;
                    return Err(EngineError::ClientError(status));
                }
                status if status >= 500 => return Err(EngineError::ServerError(status)),
                status => {
                    return Err(EngineError::Protocol(format!(
                        "unexpected chunk response status {status}"
                    )))
                }
            }
        }
    }
}

/// Parse the end offset out of a `Range: bytes=0-N` header.
fn parse_range_end(range: &str) -> Result<u64> {
    range
        .strip_prefix("bytes=0-")
        .and_then(|end| end.parse().ok())
        .ok_or_else(|| EngineError::Protocol(format!("malformed Range header '{range}'")))
}

fn status_error(status: u16) -> EngineError {
    match status {
        429 => EngineError::RateLimited,
        s if s >= 500 => EngineError::ServerError(s),
        s => EngineError::ClientError(s),
    }
}

/// Size the next chunk so it takes about the target duration at the last
/// observed throughput, clamped to `[BASE_CHUNK_SIZE, max_bytes]` and rounded
/// down to a base-unit multiple.
fn next_chunk_size(last_bytes: u64, last_seconds: f64, max_bytes: u64) -> u64 {
    if last_seconds <= 0.0 {
        return max_bytes;
    }
    let next = CHUNK_UPLOAD_TARGET_SECONDS * last_bytes as f64 / last_seconds;
    if next >= max_bytes as f64 {
        return max_bytes;
    }
    if next < BASE_CHUNK_SIZE as f64 {
        return BASE_CHUNK_SIZE;
    }
    (next as u64 / BASE_CHUNK_SIZE) * BASE_CHUNK_SIZE
}

/// Lazily-read download stream over stateless byte-range `GET`s.
///
/// No session bookkeeping: a ranged `GET` is idempotent and resumable at any
/// offset, so interruption recovery is just asking again from `position`.
pub struct RangedReader {
    transport: Arc<dyn HttpTransport>,
    url: String,
    headers: Vec<(String, String)>,
    size: u64,
    position: u64,
}

impl RangedReader {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        url: impl Into<String>,
        headers: Vec<(String, String)>,
        size: u64,
    ) -> Self {
        Self {
            transport,
            url: url.into(),
            headers,
            size,
            position: 0,
        }
    }

    /// Adapt the reader into a `Stream` of chunks, e.g. for piping a
    /// download into an HTTP response body. Ends after the first error.
    pub fn into_stream(self, chunk_size: usize) -> impl Stream<Item = Result<Bytes>> + Send {
        futures_util::stream::unfold(Some(self), move |state| async move {
            let mut reader = state?;
            if reader.position() >= reader.size() {
                return None;
            }
            match reader.read_chunk(chunk_size).await {
                Ok(chunk) if chunk.is_empty() => None,
                Ok(chunk) => Some((Ok(chunk), Some(reader))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

#[async_trait]
impl ByteStream for RangedReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn seek(&mut self, position: u64) -> Result<()> {
        self.position = position.min(self.size);
        Ok(())
    }

    async fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        if self.position >= self.size || max == 0 {
            return Ok(Bytes::new());
        }
        let end = (self.position + max as u64 - 1).min(self.size - 1);
        let mut request = TransportRequest::new(Method::GET, self.url.as_str())
            .header("Range", format!("bytes={}-{}", self.position, end));
        for (name, value) in &self.headers {
            request = request.header(name, value.clone());
        }
        let response = self.transport.send(request).await?;
        match response.status {
            206 | 200 => {
                let wanted = (end - self.position + 1) as usize;
                let body = if response.body.len() > wanted {
                    response.body.slice(0..wanted)
                } else {
                    response.body
                };
                self.position += body.len() as u64;
                Ok(body)
            }
            status => Err(status_error(status)),
        }
    }
}
