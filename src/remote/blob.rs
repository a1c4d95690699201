//! Chunked blob transfer protocol with single-shot fallback.
//!
//! Per blob, per attempt: existence pre-check, session open, chunked PATCH
//! loop, session close. A registry that signals "chunked unsupported"
//! (not-found on PATCH or a transport reset) gets a fresh session and the
//! whole blob in one request. 401/405 failures downgrade the next retry
//! attempt straight to single-shot mode.

use crate::config::RetryPolicy;
use crate::error::{ReplicaError, Result};
use crate::model::FileInfo;
use crate::remote::executor::{Outcome, RequestExecutor, RequestSpec};
use crate::store::ByteThrottle;
use futures::future::try_join_all;
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;

const OCTET_STREAM: &str = "application/octet-stream";

/// One blob ready for transfer: its identity plus the loaded bytes.
#[derive(Debug, Clone)]
pub struct BlobPayload {
    pub info: FileInfo,
    pub data: Vec<u8>,
}

/// Result of one blob push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The remote already held the digest; no bytes were sent.
    AlreadyPresent,
    Transferred { bytes: u64 },
}

impl PushOutcome {
    pub fn bytes_sent(&self) -> u64 {
        match self {
            PushOutcome::AlreadyPresent => 0,
            PushOutcome::Transferred { bytes } => *bytes,
        }
    }
}

/// Transient upload-session state. Never reused after a non-success
/// response; fallback and retry paths open a fresh session.
struct TransferSession {
    location: String,
    offset: u64,
}

/// Byte ranges covering `total`, each `chunk` long except a truncated
/// final range. Inclusive bounds, matching the `Content-Range` wire form.
fn chunk_ranges(total: u64, chunk: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + chunk).min(total) - 1;
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

/// Whether a chunk failure means the registry does not support chunked
/// uploads at all, as opposed to one chunk hitting a transient fault.
fn chunking_unsupported(err: &ReplicaError) -> bool {
    match err {
        ReplicaError::NotFound(_) => true,
        ReplicaError::Network(msg) => msg.contains("reset") || msg.contains("connection closed"),
        _ => false,
    }
}

fn verify_digest(file: &FileInfo, data: &[u8]) -> Result<()> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let actual = hex::encode(hasher.finalize());
    let expected = file.sha256.strip_prefix("sha256:").unwrap_or(&file.sha256);
    if actual != expected {
        return Err(ReplicaError::Storage(format!(
            "digest mismatch for {}: local bytes hash to sha256:{actual}",
            file.digest()
        )));
    }
    Ok(())
}

/// Pushes blobs into one remote repository over the distribution API.
pub struct BlobTransfer {
    executor: RequestExecutor,
    base_url: String,
    repository: String,
    chunk_size: usize,
    parallelism: usize,
    throttle: Arc<dyn ByteThrottle>,
    retry: RetryPolicy,
}

impl BlobTransfer {
    pub fn new(
        executor: RequestExecutor,
        base_url: impl Into<String>,
        repository: impl Into<String>,
        chunk_size: usize,
        parallelism: usize,
        throttle: Arc<dyn ByteThrottle>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            executor,
            base_url: base_url.into(),
            repository: repository.into(),
            chunk_size,
            parallelism: parallelism.max(1),
            throttle,
            retry,
        }
    }

    /// Push one blob. The full state machine runs per attempt; retries
    /// after an authorization or method-not-allowed failure skip the
    /// chunked path entirely.
    pub async fn push(&self, file: &FileInfo, data: &[u8]) -> Result<PushOutcome> {
        verify_digest(file, data)?;

        let downgraded = AtomicBool::new(false);
        let downgraded = &downgraded;
        self.retry
            .run("blob push", |_attempt| {
                let single = downgraded.load(Ordering::SeqCst);
                async move {
                    let result = self.attempt(file, data, single).await;
                    if let Err(err) = &result {
                        if err.triggers_downgrade() {
                            tracing::warn!(
                                digest = %file.digest(),
                                error = %err,
                                "downgrading to single-shot transfer for next attempt"
                            );
                            downgraded.store(true, Ordering::SeqCst);
                        }
                    }
                    result
                }
            })
            .await
    }

    async fn attempt(&self, file: &FileInfo, data: &[u8], single: bool) -> Result<PushOutcome> {
        if self.exists(&file.digest()).await? {
            tracing::debug!(digest = %file.digest(), "blob already present, skipping transfer");
            return Ok(PushOutcome::AlreadyPresent);
        }
        if single {
            self.push_single(file, data).await
        } else {
            self.push_chunked(file, data).await
        }
    }

    /// Push a set of blobs in parallel, bounded by the task's configured
    /// parallelism and the shared worker pool. The first failure cancels
    /// the remaining in-flight pushes.
    pub async fn push_all(&self, blobs: &[BlobPayload], pool: &Arc<Semaphore>) -> Result<u64> {
        let local = Arc::new(Semaphore::new(self.parallelism));
        let pushes = blobs.iter().map(|payload| {
            let pool = Arc::clone(pool);
            let local = Arc::clone(&local);
            async move {
                let _slot = local
                    .acquire_owned()
                    .await
                    .map_err(|_| ReplicaError::Cancelled("transfer pool closed".into()))?;
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|_| ReplicaError::Cancelled("worker pool closed".into()))?;
                self.push(&payload.info, &payload.data).await
            }
        });
        let outcomes = try_join_all(pushes).await?;
        Ok(outcomes.iter().map(PushOutcome::bytes_sent).sum())
    }

    /// HEAD existence pre-check; present digests are never re-sent.
    async fn exists(&self, digest: &str) -> Result<bool> {
        let url = format!("{}/v2/{}/blobs/{digest}", self.base_url, self.repository);
        let outcome = self
            .executor
            .execute(
                RequestSpec::new(Method::HEAD, url)
                    .ok_on(&[200, 307])
                    .absent_on(&[404]),
            )
            .await?;
        Ok(matches!(outcome, Outcome::Success(_)))
    }

    async fn open_session(&self) -> Result<TransferSession> {
        let url = format!("{}/v2/{}/blobs/uploads/", self.base_url, self.repository);
        let outcome = self
            .executor
            .execute(RequestSpec::new(Method::POST, url))
            .await?;
        let Outcome::Success(response) = outcome else {
            return Err(ReplicaError::Upload("session open yielded no response".into()));
        };
        let location = response
            .headers()
            .get("Location")
            .ok_or_else(|| {
                ReplicaError::Upload("missing Location header in session-open response".into())
            })?
            .to_str()
            .map_err(|e| ReplicaError::Upload(format!("invalid Location header: {e}")))?;

        Ok(TransferSession {
            location: self.absolutize(location),
            offset: 0,
        })
    }

    fn absolutize(&self, location: &str) -> String {
        if location.starts_with("http") {
            location.to_string()
        } else if location.starts_with('/') {
            format!("{}{location}", self.base_url)
        } else {
            format!(
                "{}/v2/{}/blobs/uploads/{location}",
                self.base_url, self.repository
            )
        }
    }

    async fn push_chunked(&self, file: &FileInfo, data: &[u8]) -> Result<PushOutcome> {
        let mut session = self.open_session().await?;
        let total = data.len() as u64;

        for (start, end) in chunk_ranges(total, self.chunk_size as u64) {
            let chunk = &data[start as usize..=end as usize];
            self.throttle.acquire(chunk.len()).await;

            match self.patch_range(&session.location, chunk, start, end).await {
                Ok(next_location) => {
                    if let Some(location) = next_location {
                        session.location = location;
                    }
                    session.offset = end + 1;
                }
                Err(err) if chunking_unsupported(&err) => {
                    tracing::warn!(
                        digest = %file.digest(),
                        offset = session.offset,
                        error = %err,
                        "chunked upload rejected, retrying as single request"
                    );
                    return self.push_single(file, data).await;
                }
                Err(err) => return Err(err),
            }
        }

        self.close_session(&session, &file.digest()).await?;
        Ok(PushOutcome::Transferred { bytes: total })
    }

    /// Single-shot transfer: fresh session, one PATCH covering the whole
    /// blob, then the finalizing PUT.
    async fn push_single(&self, file: &FileInfo, data: &[u8]) -> Result<PushOutcome> {
        let session = self.open_session().await?;
        let total = data.len() as u64;

        if total > 0 {
            self.throttle.acquire(data.len()).await;
            self.patch_range(&session.location, data, 0, total - 1)
                .await?;
        }

        self.close_session(&session, &file.digest()).await?;
        Ok(PushOutcome::Transferred { bytes: total })
    }

    /// PATCH one byte range against the session location. Returns the
    /// follow-up location when the registry rotates it.
    async fn patch_range(
        &self,
        location: &str,
        chunk: &[u8],
        start: u64,
        end: u64,
    ) -> Result<Option<String>> {
        let outcome = self
            .executor
            .execute(
                RequestSpec::new(Method::PATCH, location)
                    .header("Content-Range", format!("{start}-{end}"))
                    .bytes(OCTET_STREAM, chunk.to_vec())
                    .ok_on(&[200, 202, 204]),
            )
            .await?;
        let Outcome::Success(response) = outcome else {
            return Err(ReplicaError::Upload("chunk PATCH yielded no response".into()));
        };
        let next = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .map(|loc| self.absolutize(loc));
        Ok(next)
    }

    /// Finalize the session. Success here is the only condition under
    /// which the blob counts as transferred.
    async fn close_session(&self, session: &TransferSession, digest: &str) -> Result<()> {
        let separator = if session.location.contains('?') { '&' } else { '?' };
        let url = format!("{}{separator}digest={digest}", session.location);
        self.executor
            .execute(
                RequestSpec::new(Method::PUT, url)
                    .header("Content-Length", "0")
                    .ok_on(&[200, 201, 204]),
            )
            .await?;
        Ok(())
    }
}
