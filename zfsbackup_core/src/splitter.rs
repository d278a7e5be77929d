// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Splitter
//!
//! Size-bounded packer of the codec stream into successive [`Volume`]s.
//! Presents a single `std::io::Write` facade to whatever
//! feeds it plaintext (in production, a blocking-task bridge copying bytes
//! out of the `SnapshotSource`'s async stdout); internally it owns a
//! rolling `EncodeWriter<Volume>` and seals+emits a volume every time the
//! *post-encoding* byte count crosses `volume_size_bytes`.
//!
//! Domain services here are synchronous and CPU/IO-bound by design (the
//! same split the teacher draws between its sync `compression.rs` /
//! `encryption.rs` adapters and the async infrastructure that drives them);
//! `BackupJob` bridges this onto the async pipeline with `spawn_blocking`.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use zfsbackup_domain::EncryptionKey;

use crate::codec::EncodeWriter;
use crate::volume::Volume;

/// Assigns the on-disk object name for the `index`-th (one-based) volume.
pub trait VolumeNamer: Send {
    fn name(&self, index: u32) -> String;
}

impl<F: Fn(u32) -> String + Send> VolumeNamer for F {
    fn name(&self, index: u32) -> String {
        self(index)
    }
}

/// Packs a plaintext byte stream into size-bounded, encoded [`Volume`]s.
///
/// Sealed volumes are handed to `emit` as soon as they cross the threshold
/// (or at [`Splitter::finish`] for the trailing partial volume). `emit` is
/// a plain closure rather than a channel so this type stays runtime-agnostic;
/// the caller decides how to get volumes to the uploader.
pub struct Splitter<N: VolumeNamer, E: FnMut(Volume) -> io::Result<()>> {
    temp_dir: PathBuf,
    namer: N,
    key: EncryptionKey,
    volume_size_bytes: u64,
    next_index: u32,
    current: Option<EncodeWriter<Volume>>,
    emit: E,
    /// Pre-compression bytes ingested so far: `zfs_stream_bytes` is counted
    /// before the codec, not after.
    plaintext_bytes: Arc<AtomicU64>,
}

impl<N: VolumeNamer, E: FnMut(Volume) -> io::Result<()>> Splitter<N, E> {
    pub fn new(
        temp_dir: impl Into<PathBuf>,
        namer: N,
        key: EncryptionKey,
        volume_size_bytes: u64,
        emit: E,
        plaintext_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            namer,
            key,
            volume_size_bytes,
            next_index: 1,
            current: None,
            emit,
            plaintext_bytes,
        }
    }

    fn open_next_volume(&mut self) -> io::Result<EncodeWriter<Volume>> {
        let index = self.next_index;
        self.next_index += 1;
        let volume = Volume::create(&self.temp_dir, self.namer.name(index), index)?;
        Ok(EncodeWriter::new(volume, self.key.clone()))
    }

    /// Seals and emits the active volume if its post-encoding size has
    /// crossed the threshold. The boundary is inclusive of the byte that
    /// crossed it: no padding or alignment.
    fn maybe_roll(&mut self) -> io::Result<()> {
        let crossed = matches!(
            &self.current,
            Some(enc) if enc_bytes_written(enc) >= self.volume_size_bytes
        );
        if crossed {
            self.seal_current()?;
        }
        Ok(())
    }

    fn seal_current(&mut self) -> io::Result<()> {
        if let Some(encoder) = self.current.take() {
            let mut volume = encoder.close()?;
            volume.seal()?;
            (self.emit)(volume)?;
        }
        Ok(())
    }

    /// Closes and emits the trailing volume (even if short), if any bytes
    /// were ever written. An empty input stream produces zero non-manifest
    /// volumes, never an empty one — no volume is created in the first
    /// place when `write` is never called.
    pub fn finish(mut self) -> io::Result<()> {
        self.seal_current()
    }
}

/// Reads the byte count a `Volume` has accumulated through its encoder
/// without exposing `EncodeWriter`'s internal state.
fn enc_bytes_written<W: io::Write + VolumeProgress>(enc: &W) -> u64 {
    enc.bytes_written()
}

/// Narrow seam so `Splitter` can query progress on the volume currently
/// wrapped by an `EncodeWriter` without the codec module knowing about
/// volumes at all.
trait VolumeProgress {
    fn bytes_written(&self) -> u64;
}

impl VolumeProgress for EncodeWriter<Volume> {
    fn bytes_written(&self) -> u64 {
        self.get_ref().map(Volume::bytes_written).unwrap_or(0)
    }
}

impl<N: VolumeNamer, E: FnMut(Volume) -> io::Result<()>> Write for Splitter<N, E> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current.is_none() {
            self.current = Some(self.open_next_volume()?);
        }
        let encoder = self.current.as_mut().expect("just ensured Some");
        encoder.write_all(buf)?;
        // Force pending compressed/encrypted bytes out to the Volume so the
        // post-encoding threshold check below is accurate and prompt.
        encoder.flush()?;
        self.plaintext_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.maybe_roll()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.current {
            Some(encoder) => encoder.flush(),
            None => Ok(()),
        }
    }
}
