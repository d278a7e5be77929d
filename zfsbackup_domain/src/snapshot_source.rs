// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Snapshot Producer Port
//!
//! A callable returning (a) a child-process handle whose standard output is
//! the ZFS send stream, (b) a way to wait on its exit, (c) a way to kill it.
//! Replaceable for testing.
//!
//! This is expressed as the `SnapshotSource` trait rather than as a
//! function-pointer test seam (the original implementation patches global
//! function variables for tests; this rewrite injects an interface instead,
//! with production and mock implementations).

use async_trait::async_trait;

use crate::backend::BoxAsyncRead;
use crate::error::BackupError;
use crate::snapshot::SnapshotInfo;

/// A running snapshot-stream producer: bytes plus lifecycle control.
pub struct SnapshotStream {
    /// The ZFS send stream (or a stand-in, for tests).
    pub stdout: BoxAsyncRead,
    /// Resolves once the producer has exited; `Ok(())` for a clean exit,
    /// `Err` carrying surfaced stderr for a non-zero exit.
    pub wait: std::pin::Pin<Box<dyn futures::Future<Output = Result<(), BackupError>> + Send>>,
}

/// Produces a byte stream for a resolved snapshot (or snapshot delta).
///
/// Implementations own the external process (if any) and must honor
/// cancellation by killing it promptly.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Resolve the snapshot to back up and start streaming it.
    async fn open(&self) -> Result<(SnapshotInfo, SnapshotStream), BackupError>;

    /// Terminate the underlying producer if still running. Safe to call
    /// after normal completion (idempotent no-op in that case).
    async fn kill(&self);
}
