// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Retry Uploader
//!
//! Bounded worker pool that uploads sealed [`crate::volume::Volume`]s
//! concurrently with exponential-backoff retries.
//!
//! Workers pull from a single shared input channel (`Arc<tokio::sync::Mutex<
//! mpsc::Receiver<Volume>>>`) so `max_parallel_uploads` tasks can all drain
//! the same ordered queue without the orchestrator routing volumes to
//! specific workers. Output ordering is explicitly not guaranteed; each
//! worker holds its own clone of the output `mpsc::Sender`, so the channel
//! closes itself once every worker has exited — "last worker closes the
//! channel" is implemented via ordinary sender-drop semantics rather than an
//! explicit counter (documented in DESIGN.md).
//!
//! Multi-destination uploads: one retry attempt re-uploads the volume to
//! *every* configured destination before the attempt counts as successful.
//! The open question of what happens when destination 2 fails after
//! destination 1 already accepted the volume is resolved here as: the whole
//! attempt is retried (destination 1 re-uploads the same bytes), since
//! backends are expected to treat a same-named re-upload as an overwrite,
//! not an error — see DESIGN.md.
//!
//! Every in-flight upload is raced against the shared cancellation token, in
//! addition to passing the token into `Backend::upload` itself, so a
//! permanent failure on one destination interrupts uploads already running
//! against the others instead of waiting for them to finish on their own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use zfsbackup_domain::{Backend, BackendError, BackupError};

use crate::rate_limit::bucket;
use crate::volume::Volume;

/// Base delay for the first retry; doubled each attempt and capped at
/// `max_backoff`.
const BASE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_parallel_uploads: usize,
    pub max_backoff: Duration,
    pub max_retry_time: Duration,
    /// Shared upload throughput cap, if configured.
    pub bytes_per_second: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_parallel_uploads: 4,
            max_backoff: Duration::from_secs(300),
            max_retry_time: Duration::from_secs(3600),
            bytes_per_second: None,
        }
    }
}

/// First-writer-wins job error slot shared across upload workers: the first
/// permanent failure wins the slot, subsequent errors are logged and
/// dropped.
#[derive(Clone, Default)]
pub struct ErrorSlot(Arc<parking_lot::Mutex<Option<BackupError>>>);

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, err: BackupError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(err);
        } else {
            warn!(error = %err, "swallowing error after job already failed");
        }
    }

    pub fn take(&self) -> Option<BackupError> {
        self.0.lock().take()
    }
}

/// Concurrent bounded upload pool.
pub struct RetryUploader {
    destinations: Vec<Arc<dyn Backend>>,
    config: RetryConfig,
    cancel: CancellationToken,
    errors: ErrorSlot,
}

impl RetryUploader {
    pub fn new(destinations: Vec<Arc<dyn Backend>>, config: RetryConfig, cancel: CancellationToken, errors: ErrorSlot) -> Self {
        Self {
            destinations,
            config,
            cancel,
            errors,
        }
    }

    /// Spawns `max_parallel_uploads` worker tasks draining `input` and
    /// forwarding every successfully-uploaded volume to the returned
    /// receiver. Callers `drop` their clone of nothing extra: the returned
    /// receiver closes once all workers exit (success, cancellation, or
    /// permanent failure).
    pub fn spawn(self, input: mpsc::Receiver<Volume>) -> mpsc::Receiver<Volume> {
        let (out_tx, out_rx) = mpsc::channel(self.config.max_parallel_uploads.max(1));
        let input = Arc::new(AsyncMutex::new(input));
        let limiter = bucket(self.config.bytes_per_second);

        for worker_id in 0..self.config.max_parallel_uploads.max(1) {
            let input = input.clone();
            let out_tx = out_tx.clone();
            let destinations = self.destinations.clone();
            let config = self.config.clone();
            let cancel = self.cancel.clone();
            let errors = self.errors.clone();
            let limiter = limiter.clone();

            tokio::spawn(async move {
                loop {
                    let volume = {
                        let mut guard = input.lock().await;
                        guard.recv().await
                    };
                    let Some(volume) = volume else { break };

                    if cancel.is_cancelled() {
                        // Drain without uploading once the job has already failed;
                        // deletion is the orchestrator's responsibility.
                        continue;
                    }

                    match upload_with_retry(&volume, &destinations, &config, &cancel, limiter.clone(), worker_id).await {
                        Ok(()) => {
                            if out_tx.send(volume).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            // `upload_with_retry` only returns once a failure is
                            // terminal: permanent, retry-time exhausted, or
                            // cancelled. Any of those ends the whole job.
                            errors.record(err);
                            cancel.cancel();
                            break;
                        }
                    }
                }
            });
        }

        out_rx
    }
}

/// Uploads `volume` to every destination, retrying the whole attempt with
/// exponential backoff until it succeeds, a permanent error is hit, or
/// `max_retry_time` elapses.
#[instrument(skip(volume, destinations, config, cancel, limiter), fields(object_name = volume.object_name(), index = volume.index()))]
async fn upload_with_retry(
    volume: &Volume,
    destinations: &[Arc<dyn Backend>],
    config: &RetryConfig,
    cancel: &CancellationToken,
    limiter: Option<Arc<governor::DefaultDirectRateLimiter>>,
    worker_id: usize,
) -> Result<(), BackupError> {
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled("upload cancelled by job".into()));
        }

        match try_upload_all_destinations(volume, destinations, limiter.clone(), cancel).await {
            Ok(()) => {
                debug!(worker_id, attempt, "volume uploaded");
                return Ok(());
            }
            Err(UploadAttemptError::Cancelled) => {
                return Err(BackupError::Cancelled("upload cancelled mid-transfer".into()));
            }
            Err(UploadAttemptError::Backend(BackendError::Permanent(msg))) => {
                return Err(BackupError::Upload {
                    object_name: volume.object_name().to_string(),
                    source: BackendError::Permanent(msg),
                });
            }
            Err(UploadAttemptError::Backend(transient @ BackendError::Transient(_))) => {
                if started.elapsed() >= config.max_retry_time {
                    return Err(BackupError::Upload {
                        object_name: volume.object_name().to_string(),
                        source: transient,
                    });
                }

                let backoff = next_backoff(attempt, config.max_backoff);
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => {
                        return Err(BackupError::Cancelled("upload cancelled during backoff".into()));
                    }
                }
            }
        }
    }
}

/// `min(base * 2^attempt + jitter, max_backoff)`, jitter uniform in
/// `[0, base)`.
fn next_backoff(attempt: u32, max_backoff: Duration) -> Duration {
    let scaled = BASE_BACKOFF.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let jitter_ms = rand::rng().random_range(0..BASE_BACKOFF.as_millis().max(1) as u64);
    (scaled + Duration::from_millis(jitter_ms)).min(max_backoff)
}

/// The outcome of one attempt against every destination: either a backend's
/// own error classification, or the attempt being interrupted by
/// cancellation mid-transfer (distinct from a backend error so the caller
/// never mistakes an aborted upload for a transient failure worth retrying).
enum UploadAttemptError {
    Backend(BackendError),
    Cancelled,
}

async fn try_upload_all_destinations(
    volume: &Volume,
    destinations: &[Arc<dyn Backend>],
    limiter: Option<Arc<governor::DefaultDirectRateLimiter>>,
    cancel: &CancellationToken,
) -> Result<(), UploadAttemptError> {
    for backend in destinations {
        let file = volume
            .open_reader()
            .map_err(|e| UploadAttemptError::Backend(BackendError::Transient(format!("reopening volume for upload: {e}"))))?;
        let async_file = tokio::fs::File::from_std(file);
        let reader: zfsbackup_domain::BoxAsyncRead = match &limiter {
            Some(limiter) => Box::pin(crate::rate_limit::ThrottledReader::new(async_file, limiter.clone())),
            None => Box::pin(async_file),
        };

        tokio::select! {
            res = backend.upload(cancel, volume.object_name(), reader) => res.map_err(UploadAttemptError::Backend)?,
            _ = cancel.cancelled() => return Err(UploadAttemptError::Cancelled),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBackend;
    use std::io::Write as _;

    #[test]
    fn backoff_doubles_and_caps() {
        let max = Duration::from_secs(10);
        let b0 = next_backoff(0, max);
        let b5 = next_backoff(5, max);
        assert!(b0 >= BASE_BACKOFF && b0 < BASE_BACKOFF * 2);
        assert_eq!(b5, max);
    }

    fn sealed_volume(dir: &std::path::Path, name: &str, index: u32) -> Volume {
        let mut v = Volume::create(dir, name, index).unwrap();
        v.write_all(b"volume bytes").unwrap();
        v.seal().unwrap();
        v
    }

    /// A destination transiently fails the same upload twice before
    /// succeeding. The volume must be emitted exactly once and the backend
    /// must not see a successful upload duplicated afterward.
    #[tokio::test]
    async fn transient_failures_retry_then_succeed_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next("vol.003", 2, false);

        let config = RetryConfig {
            max_parallel_uploads: 1,
            max_backoff: Duration::from_millis(5),
            max_retry_time: Duration::from_secs(5),
            bytes_per_second: None,
        };
        let uploader = RetryUploader::new(
            vec![backend.clone() as Arc<dyn Backend>],
            config,
            CancellationToken::new(),
            ErrorSlot::new(),
        );

        let (tx, rx) = mpsc::channel(1);
        let volume = sealed_volume(dir.path(), "vol.003", 3);
        tx.send(volume).await.unwrap();
        drop(tx);

        let mut out_rx = uploader.spawn(rx);
        let uploaded = out_rx.recv().await;
        assert!(uploaded.is_some());
        assert!(out_rx.recv().await.is_none(), "volume must be emitted exactly once");
        assert_eq!(backend.attempts("vol.003"), 3);
        assert_eq!(backend.get("vol.003").unwrap(), b"volume bytes".to_vec());
    }

    /// A destination always fails transiently and `max_retry_time` is tiny.
    /// The job must fail within a small multiple of that budget, with the
    /// last transient error surfaced.
    #[tokio::test]
    async fn exhausting_max_retry_time_surfaces_the_last_transient_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next("vol.001", usize::MAX, false);

        let config = RetryConfig {
            max_parallel_uploads: 1,
            max_backoff: Duration::from_millis(5),
            max_retry_time: Duration::from_millis(5),
            bytes_per_second: None,
        };
        let errors = ErrorSlot::new();
        let uploader = RetryUploader::new(
            vec![backend.clone() as Arc<dyn Backend>],
            config,
            CancellationToken::new(),
            errors.clone(),
        );

        let (tx, rx) = mpsc::channel(1);
        let volume = sealed_volume(dir.path(), "vol.001", 1);
        tx.send(volume).await.unwrap();
        drop(tx);

        let started = Instant::now();
        let mut out_rx = uploader.spawn(rx);
        assert!(out_rx.recv().await.is_none(), "upload must never succeed");
        assert!(started.elapsed() < Duration::from_secs(1), "must fail promptly, not hang");

        let err = errors.take().expect("a terminal error must be recorded");
        match err {
            BackupError::Upload { source, .. } => assert!(matches!(source, BackendError::Transient(_))),
            other => panic!("expected an Upload/Transient error, got {other:?}"),
        }
    }

    /// A permanent failure on one destination cancels the shared token while
    /// a sibling upload is still stalled mid-transfer against another
    /// destination; that sibling must be interrupted rather than run to
    /// completion.
    #[tokio::test]
    async fn cancellation_interrupts_an_in_flight_upload() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.stall_next("vol.stalled", Duration::from_secs(30));

        let config = RetryConfig {
            max_parallel_uploads: 1,
            max_backoff: Duration::from_millis(5),
            max_retry_time: Duration::from_secs(5),
            bytes_per_second: None,
        };
        let cancel = CancellationToken::new();
        let uploader = RetryUploader::new(vec![backend.clone() as Arc<dyn Backend>], config, cancel.clone(), ErrorSlot::new());

        let (tx, rx) = mpsc::channel(1);
        let volume = sealed_volume(dir.path(), "vol.stalled", 1);
        tx.send(volume).await.unwrap();
        drop(tx);

        let mut out_rx = uploader.spawn(rx);
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), out_rx.recv()).await;
        assert_eq!(result.unwrap(), None, "stalled upload must be interrupted promptly, not left to finish");
    }
}
