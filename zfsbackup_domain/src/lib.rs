// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # zfsbackup-domain
//!
//! Pure types and port traits for the zfsbackup off-site backup engine: no
//! I/O, no tokio runtime dependency beyond the async *trait signatures* for
//! the [`Backend`] and [`SnapshotSource`] ports (the implementations of
//! those ports live in `zfsbackup-core` and in whatever crate an embedder
//! supplies).
//!
//! ## Layout
//!
//! - [`error`] — the domain error taxonomy ([`BackupError`]).
//! - [`snapshot`] — [`SnapshotInfo`], identifying a point-in-time source.
//! - [`snapshot_source`] — the [`SnapshotSource`] port.
//! - [`job`] — [`JobInfo`] (also the manifest payload), [`VolumeRecord`],
//!   [`JobState`].
//! - [`backend`] — the [`Backend`] port and its error classification.
//! - [`key`] — [`EncryptionKey`], a zeroizing key-material wrapper.

pub mod backend;
pub mod error;
pub mod job;
pub mod key;
pub mod snapshot;
pub mod snapshot_source;

pub use backend::{Backend, BackendError, BackendOptions, BoxAsyncRead, BoxAsyncWrite};
pub use error::BackupError;
pub use job::{JobInfo, JobState, VolumeRecord};
pub use key::EncryptionKey;
pub use snapshot::SnapshotInfo;
pub use snapshot_source::{SnapshotSource, SnapshotStream};
