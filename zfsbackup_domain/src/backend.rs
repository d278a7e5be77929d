// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Backend Port
//!
//! The abstract destination capability set the core pipeline consumes;
//! concrete object-store, local filesystem, or other implementations live
//! outside this crate and are registered against a URI scheme.
//!
//! `Backend` is a port in the Clean Architecture sense: the domain layer
//! defines the contract, infrastructure supplies the implementation. It is
//! `async_trait` because every operation here is I/O-bound, not CPU-bound
//! business logic.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Classification a backend attaches to a failed operation.
///
/// "Classification of permanent versus transient is delegated to the
/// backend... default when unlabelled: transient."
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// Retryable: timeouts, connection resets, throttling.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Not retryable: bad credentials, object-already-exists, 4xx-equivalent.
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, BackendError::Permanent(_))
    }
}

/// Opaque backend-specific initialization options, passed through unmodified
/// from the URI's opaque remainder.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub uri: String,
}

/// A boxed, object-safe async reader/writer pair used at the Backend seam so
/// the trait itself can remain object-safe (constructed once per destination
/// per job via the URI-scheme registry, see `zfsbackup-core::backend_registry`).
pub type BoxAsyncRead = std::pin::Pin<Box<dyn AsyncRead + Send + Unpin>>;
pub type BoxAsyncWrite = std::pin::Pin<Box<dyn AsyncWrite + Send + Unpin>>;

/// Abstract remote destination for backup volumes and manifests.
///
/// Implementers MUST treat `upload` as consuming the reader until EOF, and
/// MUST NOT buffer the entire volume in memory (volumes may exceed available
/// RAM). Every operation carries the job's cancellation token so a backend
/// can abort an in-flight request promptly instead of running it to
/// completion after the job has already failed.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// One-time setup side effects (e.g. opening a client, validating
    /// credentials). Called once per destination per job.
    async fn init(&self, cancel: &CancellationToken, options: &BackendOptions) -> Result<(), BackendError>;

    /// Streaming upload. Must consume `reader` until EOF.
    async fn upload(&self, cancel: &CancellationToken, object_name: &str, reader: BoxAsyncRead) -> Result<(), BackendError>;

    /// Streaming download, used by the restore path (out of scope here; the
    /// interface is specified so restore tooling outside this crate can
    /// depend on the same trait).
    async fn download(&self, cancel: &CancellationToken, object_name: &str) -> Result<BoxAsyncRead, BackendError>;

    /// List objects under a prefix.
    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> Result<Vec<String>, BackendError>;

    /// Hint for cold-storage restore; a no-op for most backends.
    async fn predownload(&self, cancel: &CancellationToken, object_names: &[String]) -> Result<(), BackendError>;

    /// Remove an object. Idempotent.
    async fn delete(&self, cancel: &CancellationToken, object_name: &str) -> Result<(), BackendError>;

    /// Release any held resources (connections, file handles).
    async fn close(&self) -> Result<(), BackendError>;
}
