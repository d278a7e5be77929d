// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Snapshot Identity
//!
//! `SnapshotInfo` identifies a single point-in-time ZFS snapshot or
//! bookmark. It carries no behavior of its own; snapshot *discovery* and the
//! `zfs send` invocation that turns a snapshot into a byte stream are
//! external collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable record identifying a point-in-time source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub creation_time: DateTime<Utc>,
    pub bookmark: bool,
}

impl SnapshotInfo {
    pub fn new(name: impl Into<String>, creation_time: DateTime<Utc>, bookmark: bool) -> Self {
        Self {
            name: name.into(),
            creation_time,
            bookmark,
        }
    }
}

impl fmt::Display for SnapshotInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bookmark {
            write!(f, "{}#{}", self.name, self.creation_time)
        } else {
            write!(f, "{}@{}", self.name, self.creation_time)
        }
    }
}
