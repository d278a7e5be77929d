// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Job Descriptor and Manifest
//!
//! `JobInfo` is the mutable orchestration record for one backup run. It
//! doubles as the manifest: the exact same struct, serialized to JSON, is
//! the final artifact uploaded by the pipeline.
//!
//! Invariants (enforced by the orchestrator, not by this type — `JobInfo` is
//! a plain data holder so it round-trips through JSON without custom
//! validation logic getting in the way):
//!
//! - `volumes` is ordered by creation.
//! - Each `VolumeRecord::object_name` is unique within the job.
//! - `end_time` is set exactly once, after every volume upload has
//!   succeeded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::EncryptionKey;
use crate::snapshot::SnapshotInfo;

/// Lifecycle state of a backup job.
///
/// Recorded on the manifest itself so restore tooling auditing a manifest
/// after the fact can tell how the job that produced it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Init,
    Running,
    Draining,
    Manifesting,
    Done,
    Failed,
}

/// A single uploaded volume's accounting record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub object_name: String,
    pub size: u64,
    #[serde(with = "hex_digest")]
    pub sha256: [u8; 32],
    pub index: u32,
}

mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("sha256 digest must be 32 bytes"))
    }
}

/// Policy and identity for a single backup run; also the manifest payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    // Identity
    pub volume_name: String,
    pub base_snapshot: SnapshotInfo,
    pub incremental_from: Option<SnapshotInfo>,

    // Policy
    pub volume_size_bytes: u64,
    pub upload_chunk_size: u64,
    pub max_parallel_uploads: usize,
    pub max_backoff: std::time::Duration,
    pub max_retry_time: std::time::Duration,
    pub manifest_prefix: String,
    pub destinations: Vec<String>,
    #[serde(skip_serializing, skip_deserializing)]
    pub aes_encryption_key: EncryptionKey,

    // Progress
    pub zfs_stream_bytes: u64,
    pub volumes: Vec<VolumeRecord>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    /// How the job ended; `Init`/`Running`/`Draining`/`Manifesting` only
    /// ever appear transiently in memory, never in an uploaded manifest.
    pub state: JobState,
}

impl JobInfo {
    /// Object name for the `index`-th (one-based) non-manifest volume.
    pub fn volume_object_name(&self, index: u32) -> String {
        let base = format!("{}{}.zstream.gz", self.volume_name, self.base_snapshot.name);
        if self.aes_encryption_key.is_empty() {
            format!("{base}.{index:03}")
        } else {
            format!("{base}.bin.{index:03}")
        }
    }

    /// Object name for the manifest.
    pub fn manifest_object_name(&self) -> String {
        let base = format!("{}{}.manifest.gz", self.volume_name, self.base_snapshot.name);
        let base = if self.aes_encryption_key.is_empty() {
            base
        } else {
            format!("{base}.bin")
        };
        format!("{}/{}", self.manifest_prefix, base)
    }

    /// Inserts `record` at the position matching its `index`, keeping
    /// `volumes` ordered by creation regardless of the order in which
    /// uploads actually complete.
    pub fn record_volume(&mut self, record: VolumeRecord) {
        let pos = self.volumes.partition_point(|r| r.index < record.index);
        self.volumes.insert(pos, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> JobInfo {
        JobInfo {
            volume_name: "tank-backup-".into(),
            base_snapshot: SnapshotInfo::new("tank/data", Utc::now(), false),
            incremental_from: None,
            volume_size_bytes: 1024 * 1024,
            upload_chunk_size: 64 * 1024,
            max_parallel_uploads: 4,
            max_backoff: std::time::Duration::from_secs(30),
            max_retry_time: std::time::Duration::from_secs(300),
            manifest_prefix: "manifests".into(),
            destinations: vec!["mock://bucket".into()],
            aes_encryption_key: EncryptionKey::empty(),
            zfs_stream_bytes: 0,
            volumes: vec![],
            start_time: Utc::now(),
            end_time: None,
            state: JobState::Init,
        }
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let mut job = sample_job();
        job.record_volume(VolumeRecord {
            object_name: "vol-1".into(),
            size: 42,
            sha256: [7u8; 32],
            index: 1,
        });
        job.end_time = Some(Utc::now());
        job.state = JobState::Done;

        let json = serde_json::to_string(&job).unwrap();
        let parsed: JobInfo = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.volume_name, job.volume_name);
        assert_eq!(parsed.volumes, job.volumes);
        assert_eq!(parsed.end_time, job.end_time);
        assert_eq!(parsed.state, job.state);
        // the key is intentionally not part of the manifest
        assert!(parsed.aes_encryption_key.is_empty());
    }

    #[test]
    fn record_volume_keeps_volumes_ordered_by_index_regardless_of_arrival_order() {
        let mut job = sample_job();
        let record = |index: u32| VolumeRecord {
            object_name: format!("vol-{index}"),
            size: 1,
            sha256: [0u8; 32],
            index,
        };
        job.record_volume(record(3));
        job.record_volume(record(1));
        job.record_volume(record(2));

        let indices: Vec<u32> = job.volumes.iter().map(|v| v.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn unencrypted_object_names_drop_the_bin_suffix() {
        let job = sample_job();
        assert_eq!(job.volume_object_name(1), "tank-backup-tank/data.zstream.gz.001");
        assert_eq!(job.manifest_object_name(), "manifests/tank-backup-tank/data.manifest.gz");
    }

    #[test]
    fn encrypted_object_names_keep_the_bin_suffix() {
        let mut job = sample_job();
        job.aes_encryption_key = EncryptionKey::new(vec![1; 16]);
        assert_eq!(job.volume_object_name(1), "tank-backup-tank/data.zstream.gz.bin.001");
        assert_eq!(
            job.manifest_object_name(),
            "manifests/tank-backup-tank/data.manifest.gz.bin"
        );
    }
}
