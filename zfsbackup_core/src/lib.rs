// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # zfsbackup-core
//!
//! Infrastructure and application layer for the zfsbackup off-site backup
//! engine: the streaming pipeline, the retry/upload worker pool, and the
//! end-to-end orchestrator.
//!
//! ```text
//! SnapshotSource ─► Splitter ─► Volume(compress→encrypt→spill) ─► RetryUploader ─► ManifestWriter
//! ```
//!
//! ## Layout
//!
//! - [`codec`] — [`codec::EncodeWriter`] / [`codec::DecodeReader`], the
//!   compress+encrypt frame.
//! - [`volume`] — [`volume::Volume`], the scoped spill-to-disk buffer.
//! - [`splitter`] — [`splitter::Splitter`], the size-bounded volume packer.
//! - [`retry_uploader`] — [`retry_uploader::RetryUploader`], the bounded
//!   concurrent upload pool with backoff retries.
//! - [`backup_job`] — [`backup_job::BackupJob`], the end-to-end orchestrator.
//! - [`backend_registry`] — URI-scheme → `Backend` constructor lookup.
//! - [`config`] — [`config::JobConfig`], layered TOML/env configuration.
//! - [`logging`] — `tracing` subscriber setup.
//! - [`rate_limit`] — shared upload-bandwidth token bucket.
//! - [`testing`] — in-memory `Backend` and `SnapshotSource` test doubles,
//!   public so embedders can reuse them.
//!
//! Concrete backend implementations (object stores, local filesystem),
//! `zfs` invocation, snapshot discovery, and the CLI surface are all out of
//! scope for this crate — callers supply a
//! [`zfsbackup_domain::SnapshotSource`] and register
//! [`zfsbackup_domain::Backend`] constructors in a [`backend_registry::BackendRegistry`].

pub mod backend_registry;
pub mod backup_job;
pub mod codec;
pub mod config;
pub mod logging;
pub mod rate_limit;
pub mod retry_uploader;
pub mod splitter;
pub mod testing;
pub mod volume;

pub use backend_registry::{BackendConstructor, BackendRegistry};
pub use backup_job::{BackupJob, BackupJobSpec};
pub use config::JobConfig;
pub use retry_uploader::{ErrorSlot, RetryConfig, RetryUploader};

pub use zfsbackup_domain::{
    Backend, BackendError, BackendOptions, BackupError, EncryptionKey, JobInfo, JobState, SnapshotInfo, SnapshotSource,
    SnapshotStream, VolumeRecord,
};
