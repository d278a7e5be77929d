// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Backup Job Orchestrator
//!
//! End-to-end sequencing of the pipeline:
//!
//! ```text
//! SnapshotSource ─► Splitter ─► Volume(compress→encrypt→spill) ─► RetryUploader ─► ManifestWriter
//! ```
//!
//! `BackupJob::run` resolves the snapshot, bridges its async byte stream
//! into the synchronous [`crate::splitter::Splitter`] on a blocking task,
//! drains uploaded volumes as they complete, and — only after every
//! non-manifest volume has been durably uploaded, the one global
//! synchronization point in the pipeline — builds, encodes, and uploads the
//! manifest.
//!
//! State machine: `Init → Running → Draining → Manifesting → Done | Failed`,
//! recorded on [`JobInfo::state`] and unidirectional; `Failed` is absorbing.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use zfsbackup_domain::{Backend, BackupError, EncryptionKey, JobInfo, JobState, SnapshotSource, VolumeRecord};

use crate::codec::EncodeWriter;
use crate::config::JobConfig;
use crate::retry_uploader::{ErrorSlot, RetryConfig, RetryUploader};
use crate::splitter::Splitter;
use crate::volume::Volume;

/// Policy for a single run, independent of configuration-loading concerns
/// (those live in [`crate::config::JobConfig`]).
pub struct BackupJobSpec {
    pub volume_name: String,
    pub volume_size_bytes: u64,
    pub upload_chunk_size: u64,
    pub manifest_prefix: String,
    pub aes_encryption_key: EncryptionKey,
    pub retry: RetryConfig,
    pub destinations: Vec<String>,
}

impl BackupJobSpec {
    /// Builds a run spec from a loaded [`JobConfig`], reading the AES key
    /// from its environment-backed accessor.
    pub fn from_config(config: &JobConfig) -> Self {
        let key = config.encryption_key();
        Self {
            volume_name: config.volume_name.clone(),
            volume_size_bytes: config.volume_size_bytes,
            upload_chunk_size: config.upload_chunk_size,
            manifest_prefix: config.manifest_prefix.clone(),
            aes_encryption_key: key,
            retry: RetryConfig {
                max_parallel_uploads: config.max_parallel_uploads,
                max_backoff: config.max_backoff(),
                max_retry_time: config.max_retry_time(),
                bytes_per_second: None,
            },
            destinations: config.destinations.clone(),
        }
    }
}

/// Orchestrates one backup run from snapshot to uploaded manifest.
pub struct BackupJob {
    spec: BackupJobSpec,
    snapshot_source: Arc<dyn SnapshotSource>,
    backends: Vec<Arc<dyn Backend>>,
    temp_dir: tempfile::TempDir,
}

impl BackupJob {
    pub fn new(
        spec: BackupJobSpec,
        snapshot_source: Arc<dyn SnapshotSource>,
        backends: Vec<Arc<dyn Backend>>,
        working_directory: &str,
    ) -> Result<Self, BackupError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("zfsbackup")
            .tempdir_in(working_directory)
            .map_err(BackupError::from)?;
        Ok(Self {
            spec,
            snapshot_source,
            backends,
            temp_dir,
        })
    }

    #[instrument(skip(self), fields(volume_name = %self.spec.volume_name))]
    pub async fn run(self) -> Result<JobInfo, BackupError> {
        let cancel = CancellationToken::new();
        let errors = ErrorSlot::new();

        let (snapshot_info, stream) = match self.snapshot_source.open().await {
            Ok(ok) => ok,
            Err(e) => return Err(e),
        };

        let job_info = Arc::new(SyncMutex::new(JobInfo {
            volume_name: self.spec.volume_name.clone(),
            base_snapshot: snapshot_info.clone(),
            incremental_from: None,
            volume_size_bytes: self.spec.volume_size_bytes,
            upload_chunk_size: self.spec.upload_chunk_size,
            max_parallel_uploads: self.spec.retry.max_parallel_uploads,
            max_backoff: self.spec.retry.max_backoff,
            max_retry_time: self.spec.retry.max_retry_time,
            manifest_prefix: self.spec.manifest_prefix.clone(),
            destinations: self.spec.destinations.clone(),
            aes_encryption_key: self.spec.aes_encryption_key.clone(),
            zfs_stream_bytes: 0,
            volumes: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            state: JobState::Running,
        }));

        let result = self.run_inner(&cancel, &errors, stream, &job_info).await;

        // Cleanup runs on every exit path: kill the producer if still alive
        // and remove whatever is left of the job temp directory.
        self.snapshot_source.kill().await;
        for backend in &self.backends {
            let _ = backend.close().await;
        }
        if let Err(e) = std::fs::remove_dir_all(self.temp_dir.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove job temp directory");
            }
        }

        match result {
            // `upload_manifest` already stamped `state`/`end_time` onto the
            // uploaded manifest; reuse them here instead of re-stamping a
            // later timestamp the manifest itself never saw.
            Ok(()) => Ok(job_info.lock().clone()),
            Err(e) => {
                let mut info = job_info.lock();
                info.state = JobState::Failed;
                info.end_time = Some(Utc::now());
                error!(error = %e, "backup job failed");
                let _ = info; // keep lock scope explicit
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        cancel: &CancellationToken,
        errors: &ErrorSlot,
        stream: zfsbackup_domain::SnapshotStream,
        job_info: &Arc<SyncMutex<JobInfo>>,
    ) -> Result<(), BackupError> {
        let plaintext_bytes = Arc::new(AtomicU64::new(0));
        let (volume_tx, volume_rx) = mpsc::channel::<Volume>(self.spec.retry.max_parallel_uploads.max(1));

        let volume_name = self.spec.volume_name.clone();
        let base_name = job_info.lock().base_snapshot.name.clone();
        let key = self.spec.aes_encryption_key.clone();
        let volume_size_bytes = self.spec.volume_size_bytes;
        let encrypted = !key.is_empty();
        let temp_dir = self.temp_dir.path().to_path_buf();
        let plaintext_bytes_for_splitter = plaintext_bytes.clone();

        // Bridges the async producer stream onto the synchronous `Splitter`
        // on a dedicated blocking thread, the same split the teacher draws
        // between its sync compression/encryption adapters and the async
        // infrastructure that drives them.
        let splitter_task = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let namer = move |index: u32| {
                let base = format!("{volume_name}{base_name}.zstream.gz");
                if encrypted {
                    format!("{base}.bin.{index:03}")
                } else {
                    format!("{base}.{index:03}")
                }
            };
            let mut splitter = Splitter::new(
                temp_dir,
                namer,
                key,
                volume_size_bytes,
                move |v: Volume| {
                    volume_tx
                        .blocking_send(v)
                        .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "volume receiver dropped"))
                },
                plaintext_bytes_for_splitter,
            );
            let mut bridge = SyncIoBridge::new(stream.stdout);
            std::io::copy(&mut bridge, &mut splitter)?;
            splitter.finish()
        });

        let retry_uploader = RetryUploader::new(self.backends.clone(), self.spec.retry.clone(), cancel.clone(), errors.clone());
        let mut output_rx = retry_uploader.spawn(volume_rx);

        let job_info_drain = job_info.clone();
        let drain_task = tokio::spawn(async move {
            while let Some(volume) = output_rx.recv().await {
                let record = VolumeRecord {
                    object_name: volume.object_name().to_string(),
                    size: volume.size().unwrap_or(0),
                    sha256: volume.sha256().unwrap_or([0; 32]),
                    index: volume.index(),
                };
                job_info_drain.lock().record_volume(record);
                if let Err(e) = volume.delete() {
                    warn!(error = %e, "failed to delete uploaded volume");
                }
            }
        });

        let producer_wait = stream.wait;

        let (splitter_result, producer_result, _) = tokio::join!(
            async { splitter_task.await.map_err(|e| BackupError::internal(e.to_string()))? .map_err(BackupError::from) },
            producer_wait,
            async {
                let _ = drain_task.await;
            }
        );

        job_info.lock().zfs_stream_bytes = plaintext_bytes.load(Ordering::Relaxed);

        if let Err(e) = producer_result {
            cancel.cancel();
            errors.record(e);
        }
        if let Err(e) = splitter_result {
            cancel.cancel();
            errors.record(e);
        }

        if let Some(err) = errors.take() {
            return Err(err);
        }

        self.upload_manifest(cancel, errors, job_info).await
    }

    #[instrument(skip(self, cancel, errors, job_info))]
    async fn upload_manifest(
        &self,
        cancel: &CancellationToken,
        errors: &ErrorSlot,
        job_info: &Arc<SyncMutex<JobInfo>>,
    ) -> Result<(), BackupError> {
        let (payload, object_name, key) = {
            let mut info = job_info.lock();
            // Sort by index before freezing the payload: the drain task
            // above records volumes in upload-completion order, which can
            // differ from creation order under parallel uploads or retries.
            info.volumes.sort_by_key(|v| v.index);
            // Stamped optimistically as the final outcome: this manifest is
            // only ever visible to a restorer if its own upload below
            // succeeds, at which point the job is in fact Done. If the
            // upload fails, `run`'s error path overwrites both fields with
            // the actual failure time before returning.
            info.state = JobState::Done;
            info.end_time = Some(Utc::now());
            let object_name = info.manifest_object_name();
            let payload = serde_json::to_vec(&*info).map_err(|e| BackupError::Internal(e.to_string()))?;
            (payload, object_name, info.aes_encryption_key.clone())
        };

        let index = job_info.lock().volumes.len() as u32 + 1;
        let mut manifest_volume = Volume::create(self.temp_dir.path(), object_name, index).map_err(BackupError::from)?;
        {
            let mut encoder = EncodeWriter::new(&mut manifest_volume, key);
            encoder.write_all(&payload).map_err(BackupError::from)?;
            encoder.close().map_err(BackupError::from)?;
        }
        manifest_volume.seal().map_err(BackupError::from)?;

        let (tx, rx) = mpsc::channel::<Volume>(1);
        tx.send(manifest_volume)
            .await
            .map_err(|_| BackupError::internal("manifest channel closed unexpectedly"))?;
        drop(tx);

        let retry_uploader = RetryUploader::new(self.backends.clone(), self.spec.retry.clone(), cancel.clone(), errors.clone());
        let mut output_rx = retry_uploader.spawn(rx);

        match output_rx.recv().await {
            Some(volume) => {
                if let Err(e) = volume.delete() {
                    warn!(error = %e, "failed to delete manifest volume after upload");
                }
                info!("manifest uploaded");
                Ok(())
            }
            None => Err(errors.take().unwrap_or_else(|| BackupError::internal("manifest upload produced no result"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingSnapshotSource, MemoryBackend, MemorySnapshotSource};
    use zfsbackup_domain::SnapshotInfo;

    fn snapshot_info() -> SnapshotInfo {
        SnapshotInfo::new("tank/data", Utc::now(), false)
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_parallel_uploads: 2,
            max_backoff: Duration::from_millis(50),
            max_retry_time: Duration::from_secs(5),
            bytes_per_second: None,
        }
    }

    #[tokio::test]
    async fn small_stream_splits_and_uploads_with_manifest() {
        let data: Vec<u8> = (0..5 * 1024 * 1024u32).map(|i| (i.wrapping_mul(2654435761)) as u8).collect();
        let source = Arc::new(MemorySnapshotSource::new(snapshot_info(), data));
        let backend = Arc::new(MemoryBackend::new());

        let spec = BackupJobSpec {
            volume_name: "tank-backup-".into(),
            volume_size_bytes: 1024 * 1024,
            upload_chunk_size: 10 * 1024 * 1024,
            manifest_prefix: "manifests".into(),
            aes_encryption_key: EncryptionKey::new(b"test1234test1234".to_vec()),
            retry: retry_config(),
            destinations: vec!["mock://bucket".into()],
        };

        let dir = tempfile::tempdir().unwrap();
        let job = BackupJob::new(spec, source, vec![backend.clone()], &dir.path().to_string_lossy()).unwrap();
        let result = job.run().await.unwrap();

        assert!(result.volumes.len() >= 5);
        assert_eq!(backend.objects().len(), result.volumes.len() + 1);
        assert_eq!(result.state as u8, JobState::Done as u8);
        assert!(result.end_time.unwrap() >= result.start_time);
    }

    #[tokio::test]
    async fn permanent_failure_fails_the_job_and_leaves_no_temp_files() {
        let data: Vec<u8> = (0..5 * 1024 * 1024u32).map(|i| (i.wrapping_mul(2654435761)) as u8).collect();
        let source = Arc::new(MemorySnapshotSource::new(snapshot_info(), data));
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next("tank-backup-tank/data.zstream.gz.bin.002", 1, true);

        let spec = BackupJobSpec {
            volume_name: "tank-backup-".into(),
            volume_size_bytes: 1024 * 1024,
            upload_chunk_size: 10 * 1024 * 1024,
            manifest_prefix: "manifests".into(),
            aes_encryption_key: EncryptionKey::new(b"test1234test1234".to_vec()),
            retry: retry_config(),
            destinations: vec!["mock://bucket".into()],
        };

        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().to_path_buf();
        let job = BackupJob::new(spec, source, vec![backend.clone()], &temp_path.to_string_lossy()).unwrap();
        let err = job.run().await.unwrap_err();
        assert!(!err.is_recoverable());

        let remaining = std::fs::read_dir(&temp_path).map(|d| d.count()).unwrap_or(0);
        assert_eq!(remaining, 0);
        assert!(!backend.objects().iter().any(|o| o.contains("manifest")));
    }

    #[tokio::test]
    async fn empty_stream_uploads_only_the_manifest() {
        let source = Arc::new(MemorySnapshotSource::new(snapshot_info(), Vec::new()));
        let backend = Arc::new(MemoryBackend::new());

        let spec = BackupJobSpec {
            volume_name: "tank-backup-".into(),
            volume_size_bytes: 1024 * 1024,
            upload_chunk_size: 10 * 1024 * 1024,
            manifest_prefix: "manifests".into(),
            aes_encryption_key: EncryptionKey::empty(),
            retry: retry_config(),
            destinations: vec!["mock://bucket".into()],
        };

        let dir = tempfile::tempdir().unwrap();
        let job = BackupJob::new(spec, source, vec![backend.clone()], &dir.path().to_string_lossy()).unwrap();
        let result = job.run().await.unwrap();

        assert!(result.volumes.is_empty());
        assert_eq!(backend.objects().len(), 1);
        assert!(result.end_time.unwrap() >= result.start_time);
    }

    #[tokio::test]
    async fn uploaded_manifest_agrees_with_the_returned_job_info() {
        let source = Arc::new(MemorySnapshotSource::new(snapshot_info(), Vec::new()));
        let backend = Arc::new(MemoryBackend::new());

        let spec = BackupJobSpec {
            volume_name: "tank-backup-".into(),
            volume_size_bytes: 1024 * 1024,
            upload_chunk_size: 10 * 1024 * 1024,
            manifest_prefix: "manifests".into(),
            aes_encryption_key: EncryptionKey::empty(),
            retry: retry_config(),
            destinations: vec!["mock://bucket".into()],
        };

        let dir = tempfile::tempdir().unwrap();
        let job = BackupJob::new(spec, source, vec![backend.clone()], &dir.path().to_string_lossy()).unwrap();
        let result = job.run().await.unwrap();

        let manifest_object = backend.objects().into_iter().find(|o| o.contains("manifest")).unwrap();
        let manifest_bytes = backend.get(&manifest_object).unwrap();
        let mut decoder = crate::codec::DecodeReader::new(std::io::Cursor::new(manifest_bytes), EncryptionKey::empty());
        let mut plaintext = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut plaintext).unwrap();
        let uploaded: JobInfo = serde_json::from_slice(&plaintext).unwrap();

        assert_eq!(uploaded.state, result.state);
        assert_eq!(uploaded.state, JobState::Done);
        assert_eq!(uploaded.end_time, result.end_time);
    }

    #[tokio::test]
    async fn producer_failure_fails_the_job() {
        let source = Arc::new(FailingSnapshotSource::new(snapshot_info(), vec![1, 2, 3]));
        let backend = Arc::new(MemoryBackend::new());

        let spec = BackupJobSpec {
            volume_name: "tank-backup-".into(),
            volume_size_bytes: 1024 * 1024,
            upload_chunk_size: 10 * 1024 * 1024,
            manifest_prefix: "manifests".into(),
            aes_encryption_key: EncryptionKey::empty(),
            retry: retry_config(),
            destinations: vec!["mock://bucket".into()],
        };

        let dir = tempfile::tempdir().unwrap();
        let job = BackupJob::new(spec, source, vec![backend], &dir.path().to_string_lossy()).unwrap();
        let err = job.run().await.unwrap_err();
        assert!(matches!(err, BackupError::ProducerFailed(_)));
    }
}
