// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Backend URI Registry
//!
//! The core does not interpret URIs; this registry maps URI-scheme → Backend
//! constructor, invoked once per destination per job. Concrete backends
//! (object store, local filesystem, ...) are out of scope for this crate;
//! this module only owns the scheme → constructor map and URI parsing,
//! mirroring the teacher's repository lookup pattern
//! (`infrastructure::repositories` picks an implementation by configured
//! name) applied to backends instead.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use zfsbackup_domain::{Backend, BackendOptions, BackupError};

/// Constructs a fresh [`Backend`] instance for one destination URI.
pub type BackendConstructor = Arc<dyn Fn(&BackendOptions) -> Arc<dyn Backend> + Send + Sync>;

/// Maps a URI scheme (e.g. `s3`, `mock`) to the constructor for its
/// [`Backend`] implementation.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: impl Into<String>, ctor: BackendConstructor) {
        self.constructors.insert(scheme.into(), ctor);
    }

    /// Splits `scheme://opaque-string` and constructs the backend registered
    /// for `scheme`, passing the remainder through unmodified as
    /// [`BackendOptions::uri`].
    pub async fn resolve(&self, cancel: &CancellationToken, destination: &str) -> Result<Arc<dyn Backend>, BackupError> {
        let (scheme, _rest) = destination.split_once("://").ok_or_else(|| {
            BackupError::invalid_configuration(format!("destination URI missing scheme: {destination}"))
        })?;

        let ctor = self.constructors.get(scheme).ok_or_else(|| {
            BackupError::invalid_configuration(format!("no backend registered for scheme {scheme:?}"))
        })?;

        let options = BackendOptions {
            uri: destination.to_string(),
        };
        let backend = ctor(&options);
        backend.init(cancel, &options).await.map_err(|e| BackupError::Upload {
            object_name: String::new(),
            source: e,
        })?;
        Ok(backend)
    }

    /// Resolves every destination in `destinations`, in order.
    pub async fn resolve_all(&self, cancel: &CancellationToken, destinations: &[String]) -> Result<Vec<Arc<dyn Backend>>, BackupError> {
        let mut backends = Vec::with_capacity(destinations.len());
        for d in destinations {
            backends.push(self.resolve(cancel, d).await?);
        }
        Ok(backends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBackend;

    #[tokio::test]
    async fn resolves_registered_scheme() {
        let mut registry = BackendRegistry::new();
        registry.register("mock", Arc::new(|_opts: &BackendOptions| Arc::new(MemoryBackend::new()) as Arc<dyn Backend>));

        let cancel = CancellationToken::new();
        let backend = registry.resolve(&cancel, "mock://bucket-a").await.unwrap();
        assert_eq!(backend.list(&cancel, "").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unknown_scheme_is_a_configuration_error() {
        let registry = BackendRegistry::new();
        let err = registry.resolve(&CancellationToken::new(), "s3://bucket").await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn missing_scheme_is_a_configuration_error() {
        let registry = BackendRegistry::new();
        let err = registry.resolve(&CancellationToken::new(), "not-a-uri").await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidConfiguration(_)));
    }
}
