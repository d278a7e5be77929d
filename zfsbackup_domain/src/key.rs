// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Encryption Key Material
//!
//! Secure storage for the AES key passed to [`crate::backend`] consumers and
//! the codec layer. Zeroized on drop so key bytes don't linger in freed
//! memory, matching the teacher's `SecureKey`/`KeyMaterial` pattern.
//!
//! An empty key means "no encryption" throughout the pipeline: the codec
//! frame elides the IV and cipher layer entirely.

use std::fmt;
use zeroize::Zeroize;

#[derive(Clone, Default)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey({} bytes, redacted)", self.0.len())
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl From<Vec<u8>> for EncryptionKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}
