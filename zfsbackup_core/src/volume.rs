// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Volume
//!
//! Scoped disk-backed single-writer/single-reader buffer. A
//! `Volume` owns one file under the job's temp directory; it is filled by a
//! [`crate::codec::EncodeWriter`], sealed, read once by the uploader, and
//! always deleted — on success, on error, or on cancellation.
//!
//! The running digest uses `sha2::Sha256` with the same incremental-update
//! pattern as the teacher's `checksum_service.rs`: fed a chunk at a time as
//! bytes are written, rather than hashed in one pass at seal time.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

enum State {
    Writing { file: File, hasher: Sha256, bytes: u64 },
    Sealed { size: u64, sha256: [u8; 32] },
}

/// A single sealed-or-being-written backup chunk.
///
/// `write` is only valid before [`Volume::seal`]; `open_reader`, `size`, and
/// `sha256` are only valid after it. These invariants are enforced with
/// `io::Error`s rather than panics, since a misuse here always stems from an
/// upstream I/O failure partway through the pipeline, not a logic bug.
pub struct Volume {
    object_name: String,
    index: u32,
    path: PathBuf,
    state: State,
}

impl Volume {
    /// Creates the backing file `temp_dir/object_name` and opens it for
    /// writing. `object_name` may contain path separators (manifest object
    /// names are prefixed); intermediate directories are created as needed.
    pub fn create(temp_dir: &Path, object_name: impl Into<String>, index: u32) -> io::Result<Self> {
        let object_name = object_name.into();
        let path = temp_dir.join(&object_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self {
            object_name,
            index,
            path,
            state: State::Writing {
                file,
                hasher: Sha256::new(),
                bytes: 0,
            },
        })
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bytes written so far. Valid both before and after sealing.
    pub fn bytes_written(&self) -> u64 {
        match &self.state {
            State::Writing { bytes, .. } => *bytes,
            State::Sealed { size, .. } => *size,
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.state, State::Sealed { .. })
    }

    /// Size of the sealed volume. Only meaningful after [`Volume::seal`].
    pub fn size(&self) -> io::Result<u64> {
        match &self.state {
            State::Sealed { size, .. } => Ok(*size),
            State::Writing { .. } => Err(not_sealed()),
        }
    }

    /// Digest of the sealed volume's bytes. Only meaningful after
    /// [`Volume::seal`].
    pub fn sha256(&self) -> io::Result<[u8; 32]> {
        match &self.state {
            State::Sealed { sha256, .. } => Ok(*sha256),
            State::Writing { .. } => Err(not_sealed()),
        }
    }

    /// Flushes and closes the writer, freezing size and digest. Fails if
    /// already sealed.
    pub fn seal(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.state, State::Sealed { size: 0, sha256: [0; 32] }) {
            State::Writing { mut file, hasher, bytes } => {
                file.flush()?;
                let digest: [u8; 32] = hasher.finalize().into();
                self.state = State::Sealed { size: bytes, sha256: digest };
                Ok(())
            }
            sealed @ State::Sealed { .. } => {
                self.state = sealed;
                Err(already_sealed())
            }
        }
    }

    /// Opens a fresh, independent read handle rewound to the start of the
    /// backing file. Callers may call this more than once (the uploader
    /// re-opens from the start on every retry attempt).
    pub fn open_reader(&self) -> io::Result<File> {
        if !self.is_sealed() {
            return Err(not_sealed());
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    /// Removes the backing file. Idempotent: a missing file is not an
    /// error, since `delete` may run more than once across overlapping
    /// cleanup paths (normal completion racing with cancellation cleanup).
    pub fn delete(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Write for Volume {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            State::Writing { file, hasher, bytes } => {
                let n = file.write(buf)?;
                hasher.update(&buf[..n]);
                *bytes += n as u64;
                Ok(n)
            }
            State::Sealed { .. } => Err(io::Error::new(io::ErrorKind::Other, "volume already sealed, cannot write")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            State::Writing { file, .. } => file.flush(),
            State::Sealed { .. } => Ok(()),
        }
    }
}

/// Best-effort safety net: if a `Volume` is dropped without an explicit
/// `delete()` call (a bug, or a panic unwinding through the pipeline), the
/// backing file is removed anyway rather than leaking it under the job temp
/// directory. Errors here are unobservable by design (`Drop` cannot
/// propagate them) so they are only logged.
impl Drop for Volume {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "failed to remove volume file on drop");
            }
        }
    }
}

fn not_sealed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "volume is not sealed yet")
}

fn already_sealed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "volume is already sealed")
}

/// Reads the full contents of a sealed volume into memory. Used by tests
/// and by the manifest round-trip check; production code streams instead.
#[cfg(test)]
pub(crate) fn read_all(volume: &Volume) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    volume.open_reader()?.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_seal_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = Volume::create(dir.path(), "vol.001", 1).unwrap();
        v.write_all(b"hello volume").unwrap();
        v.seal().unwrap();

        assert_eq!(v.size().unwrap(), 12);
        let data = read_all(&v).unwrap();
        assert_eq!(data, b"hello volume");
    }

    #[test]
    fn write_after_seal_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = Volume::create(dir.path(), "vol.001", 1).unwrap();
        v.seal().unwrap();
        assert!(v.write_all(b"too late").is_err());
    }

    #[test]
    fn read_before_seal_fails() {
        let dir = tempfile::tempdir().unwrap();
        let v = Volume::create(dir.path(), "vol.001", 1).unwrap();
        assert!(v.open_reader().is_err());
    }

    #[test]
    fn double_seal_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = Volume::create(dir.path(), "vol.001", 1).unwrap();
        v.seal().unwrap();
        assert!(v.seal().is_err());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = Volume::create(dir.path(), "vol.001", 1).unwrap();
        v.seal().unwrap();
        v.delete().unwrap();
        v.delete().unwrap();
    }

    #[test]
    fn sha256_matches_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = Volume::create(dir.path(), "vol.001", 1).unwrap();
        v.write_all(b"digest me").unwrap();
        v.seal().unwrap();

        let mut expected = Sha256::new();
        expected.update(b"digest me");
        let expected: [u8; 32] = expected.finalize().into();
        assert_eq!(v.sha256().unwrap(), expected);
    }

    #[test]
    fn drop_without_delete_still_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mut v = Volume::create(dir.path(), "vol.001", 1).unwrap();
            path = dir.path().join("vol.001");
            v.write_all(b"x").unwrap();
            v.seal().unwrap();
        }
        assert!(!path.exists());
    }
}
