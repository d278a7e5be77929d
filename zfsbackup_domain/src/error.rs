// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Backup Error System
//!
//! Domain-level error taxonomy for the backup engine, covering
//! transient/permanent upload failures, producer failures, codec failures,
//! cancellation, and local I/O.
//!
//! ## Design Principles
//!
//! - **Specific**: each variant names a single failure mode.
//! - **Classifiable**: `is_recoverable()` distinguishes errors a caller may
//!   retry the whole job for from ones that won't improve on retry.
//! - **Backend-delegated**: upload errors carry a nested [`BackendError`]
//!   whose permanent/transient tag comes from the backend, not this crate.

use thiserror::Error;

use crate::backend::BackendError;

/// Errors that can terminate a backup job.
#[derive(Error, Debug, Clone)]
pub enum BackupError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("local I/O error: {0}")]
    Io(String),

    #[error("upload failed for {object_name}: {source}")]
    Upload {
        object_name: String,
        source: BackendError,
    },

    #[error("snapshot producer failed: {0}")]
    ProducerFailed(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BackupError {
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the *same* job from scratch could plausibly succeed.
    ///
    /// Cancellation and permanent upload failures are not recoverable;
    /// everything else may be transient host/environment trouble.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            BackupError::Cancelled(_)
                | BackupError::Upload {
                    source: BackendError::Permanent(_),
                    ..
                }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled(_))
    }
}

impl From<std::io::Error> for BackupError {
    fn from(e: std::io::Error) -> Self {
        BackupError::Io(e.to_string())
    }
}
