// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Test Doubles
//!
//! An in-memory [`Backend`] and a byte-slice [`SnapshotSource`], grounded on
//! `original_source/backends/mock_backend.go` and `backup/mock_zfs/mock.go`.
//! Public (not `#[cfg(test)]`-gated) so both this crate's integration tests
//! and downstream embedders' test suites can use them without duplicating
//! failure-injection plumbing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use zfsbackup_domain::{Backend, BackendError, BackendOptions, BoxAsyncRead, BackupError, SnapshotInfo, SnapshotSource, SnapshotStream};

/// Scripted failure for one object name: fail the first `n` upload
/// attempts, then succeed (or fail forever if `n == usize::MAX`).
#[derive(Clone, Copy, Debug)]
pub struct FailurePlan {
    pub remaining_failures: usize,
    pub permanent: bool,
}

/// An in-memory [`Backend`] for tests: stores uploaded bytes in a `Mutex`-
/// guarded map and can be scripted to fail specific objects transiently or
/// permanently a set number of times before succeeding, or to stall for a
/// fixed delay so tests can exercise mid-upload cancellation.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, FailurePlan>>,
    upload_attempts: Mutex<HashMap<String, u32>>,
    upload_delay: Mutex<HashMap<String, Duration>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `object_name`'s next `count` upload attempts to fail
    /// (transiently unless `permanent` is set), before succeeding.
    pub fn fail_next(&self, object_name: impl Into<String>, count: usize, permanent: bool) {
        self.failures.lock().insert(
            object_name.into(),
            FailurePlan {
                remaining_failures: count,
                permanent,
            },
        );
    }

    /// Makes `object_name`'s upload sleep for `delay` before reading the
    /// stream, so tests can race cancellation against a slow in-flight
    /// upload.
    pub fn stall_next(&self, object_name: impl Into<String>, delay: Duration) {
        self.upload_delay.lock().insert(object_name.into(), delay);
    }

    pub fn objects(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn get(&self, object_name: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(object_name).cloned()
    }

    pub fn attempts(&self, object_name: &str) -> u32 {
        *self.upload_attempts.lock().get(object_name).unwrap_or(&0)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self, _cancel: &CancellationToken, _options: &BackendOptions) -> Result<(), BackendError> {
        Ok(())
    }

    async fn upload(&self, cancel: &CancellationToken, object_name: &str, mut reader: BoxAsyncRead) -> Result<(), BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Transient("upload cancelled before starting".into()));
        }
        *self.upload_attempts.lock().entry(object_name.to_string()).or_insert(0) += 1;

        if let Some(delay) = self.upload_delay.lock().get(object_name).copied() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(BackendError::Transient("upload cancelled during stall".into()));
                }
            }
        }

        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| BackendError::Transient(format!("reading upload stream: {e}")))?;

        let plan = self.failures.lock().get(object_name).copied();
        if let Some(mut plan) = plan {
            if plan.remaining_failures > 0 {
                plan.remaining_failures -= 1;
                self.failures.lock().insert(object_name.to_string(), plan);
                return Err(if plan.permanent {
                    BackendError::Permanent(format!("scripted permanent failure for {object_name}"))
                } else {
                    BackendError::Transient(format!("scripted transient failure for {object_name}"))
                });
            }
        }

        self.objects.lock().insert(object_name.to_string(), buf);
        Ok(())
    }

    async fn download(&self, _cancel: &CancellationToken, object_name: &str) -> Result<BoxAsyncRead, BackendError> {
        let bytes = self
            .objects
            .lock()
            .get(object_name)
            .cloned()
            .ok_or_else(|| BackendError::Permanent(format!("no such object: {object_name}")))?;
        Ok(Box::pin(std::io::Cursor::new(bytes)))
    }

    async fn list(&self, _cancel: &CancellationToken, prefix: &str) -> Result<Vec<String>, BackendError> {
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn predownload(&self, _cancel: &CancellationToken, _object_names: &[String]) -> Result<(), BackendError> {
        Ok(())
    }

    async fn delete(&self, _cancel: &CancellationToken, object_name: &str) -> Result<(), BackendError> {
        self.objects.lock().remove(object_name);
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// A [`SnapshotSource`] that streams a fixed byte buffer instead of
/// spawning `zfs send`, standing in for `backup/mock_zfs`.
pub struct MemorySnapshotSource {
    info: SnapshotInfo,
    data: Arc<Vec<u8>>,
}

impl MemorySnapshotSource {
    pub fn new(info: SnapshotInfo, data: Vec<u8>) -> Self {
        Self {
            info,
            data: Arc::new(data),
        }
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshotSource {
    async fn open(&self) -> Result<(SnapshotInfo, SnapshotStream), BackupError> {
        let stdout: BoxAsyncRead = Box::pin(std::io::Cursor::new((*self.data).clone()));
        let stream = SnapshotStream {
            stdout,
            wait: Box::pin(async { Ok(()) }),
        };
        Ok((self.info.clone(), stream))
    }

    async fn kill(&self) {}
}

/// A [`SnapshotSource`] whose producer reports a non-zero exit after
/// streaming some bytes, for testing the producer-failure path.
pub struct FailingSnapshotSource {
    info: SnapshotInfo,
    data: Arc<Vec<u8>>,
}

impl FailingSnapshotSource {
    pub fn new(info: SnapshotInfo, data: Vec<u8>) -> Self {
        Self {
            info,
            data: Arc::new(data),
        }
    }
}

#[async_trait]
impl SnapshotSource for FailingSnapshotSource {
    async fn open(&self) -> Result<(SnapshotInfo, SnapshotStream), BackupError> {
        let stdout: BoxAsyncRead = Box::pin(std::io::Cursor::new((*self.data).clone()));
        let stream = SnapshotStream {
            stdout,
            wait: Box::pin(async { Err(BackupError::ProducerFailed("zfs send exited with status 1".into())) }),
        };
        Ok((self.info.clone(), stream))
    }

    async fn kill(&self) {}
}
