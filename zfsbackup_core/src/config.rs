// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Job Configuration
//!
//! `JobConfig` loads the pipeline's policy knobs from a layered source
//! chain: an optional TOML file, then `ZFSBACKUP_*` environment variables,
//! then explicit overrides. This mirrors the teacher's
//! `infrastructure::config` layering approach (the `config` crate over
//! `serde`), scoped down to the fields this pipeline actually has.
//!
//! `aes_encryption_key` is deliberately absent from the struct: the key
//! comes from the `ENCRYPTION_KEY` environment variable as a fallback, and
//! key material does not belong in a `Deserialize`d struct that might get
//! logged or serialized back out. [`JobConfig::encryption_key`] reads it
//! explicitly.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use zfsbackup_domain::{BackupError, EncryptionKey};

const ENV_PREFIX: &str = "ZFSBACKUP";

/// Policy settings for a single backup run, independent of which snapshot
/// is being backed up (that comes from the `SnapshotSource` at run time).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub volume_name: String,
    pub volume_size_bytes: u64,
    pub upload_chunk_size: u64,
    pub max_parallel_uploads: usize,
    pub max_backoff_secs: u64,
    pub max_retry_time_secs: u64,
    pub manifest_prefix: String,
    pub destinations: Vec<String>,
    pub working_directory: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            volume_name: "backup-".to_string(),
            volume_size_bytes: 200 * 1024 * 1024,
            upload_chunk_size: 10 * 1024 * 1024,
            max_parallel_uploads: 4,
            max_backoff_secs: 300,
            max_retry_time_secs: 3600,
            manifest_prefix: "manifests".to_string(),
            destinations: Vec::new(),
            working_directory: std::env::temp_dir().to_string_lossy().into_owned(),
        }
    }
}

impl JobConfig {
    /// Loads configuration from an optional TOML file, then `ZFSBACKUP_*`
    /// environment variable overrides (e.g. `ZFSBACKUP_VOLUME_SIZE_BYTES`),
    /// falling back to [`JobConfig::default`] values for anything unset.
    pub fn load(toml_path: Option<&str>) -> Result<Self, BackupError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).map_err(config_err)?);

        if let Some(path) = toml_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("_")
                .try_parsing(true),
        );

        builder
            .build()
            .map_err(config_err)?
            .try_deserialize()
            .map_err(config_err)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn max_retry_time(&self) -> Duration {
        Duration::from_secs(self.max_retry_time_secs)
    }

    /// Reads the AES key from the `ENCRYPTION_KEY` environment variable;
    /// an unset or empty variable means "no encryption".
    pub fn encryption_key(&self) -> EncryptionKey {
        match std::env::var("ENCRYPTION_KEY") {
            Ok(raw) if !raw.is_empty() => EncryptionKey::new(raw.into_bytes()),
            _ => EncryptionKey::empty(),
        }
    }
}

fn config_err(e: config::ConfigError) -> BackupError {
    BackupError::invalid_configuration(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = JobConfig::default();
        assert!(cfg.volume_size_bytes > 0);
        assert!(cfg.max_parallel_uploads > 0);
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let cfg = JobConfig::load(None).unwrap();
        assert_eq!(cfg.manifest_prefix, "manifests");
    }

    #[test]
    fn environment_override_wins_over_default() {
        std::env::set_var("ZFSBACKUP_MANIFEST_PREFIX", "custom-manifests");
        let cfg = JobConfig::load(None).unwrap();
        std::env::remove_var("ZFSBACKUP_MANIFEST_PREFIX");
        assert_eq!(cfg.manifest_prefix, "custom-manifests");
    }

    #[test]
    fn missing_encryption_key_env_var_means_no_encryption() {
        std::env::remove_var("ENCRYPTION_KEY");
        let cfg = JobConfig::default();
        assert!(cfg.encryption_key().is_empty());
    }
}
