// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Logging
//!
//! Structured logging setup for a backup run. Simplified from the teacher's
//! `infrastructure::logging` observability module: no metrics/alerting
//! surface (out of scope here), just a `tracing` subscriber with an
//! `RUST_LOG`-driven filter, grounded on the daemon init pattern in
//! `groblegark-oddjobs/crates/daemon/src/main.rs`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes a global `tracing` subscriber for the current process.
///
/// Respects `RUST_LOG` (standard `EnvFilter` syntax); defaults to `info`
/// when unset or invalid. Idempotent-ish in the sense that a second call
/// simply fails to install and is ignored — tests that spin up multiple
/// `BackupJob`s in one process call this once via `Once`.
pub fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init();
    });
}
