// /////////////////////////////////////////////////////////////////////////////
// zfsbackup
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Upload Bandwidth Limiting
//!
//! If a rate-limit bucket is configured, the upload path wraps the Volume
//! reader in a throttled reader. The bucket is shared across all workers,
//! so it caps the job's total upload throughput rather than each worker's.
//!
//! The original implementation uses `github.com/juju/ratelimit`, a token
//! bucket. `governor` is the nearest idiomatic Rust equivalent (GCRA token
//! bucket) and is this crate's one addition beyond the teacher's dependency
//! set for this purpose.

use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Future;
use governor::{DefaultDirectRateLimiter, Quota};
use tokio::io::{AsyncRead, ReadBuf};

/// Largest slice throttled in a single permit check. Bounds how long a
/// single `poll_read` can wait and how bursty a "ready" read can be.
const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// Builds a shared byte-per-second rate limiter, or `None` when unbounded.
pub fn bucket(bytes_per_second: Option<u32>) -> Option<Arc<DefaultDirectRateLimiter>> {
    let bps = bytes_per_second?;
    let quota = Quota::per_second(NonZeroU32::new(bps.max(1))?).allow_burst(NonZeroU32::new(MAX_CHUNK_BYTES as u32)?);
    Some(Arc::new(governor::RateLimiter::direct(quota)))
}

/// Wraps an `AsyncRead` so reads drain no faster than the shared bucket's
/// configured rate. `R` must be `Unpin`; every concrete reader type this
/// crate hands to a `Backend` (boxed volume/file readers) already is.
pub struct ThrottledReader<R> {
    inner: R,
    limiter: Arc<DefaultDirectRateLimiter>,
    waiting: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl<R> ThrottledReader<R> {
    pub fn new(inner: R, limiter: Arc<DefaultDirectRateLimiter>) -> Self {
        Self {
            inner,
            limiter,
            waiting: None,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        loop {
            if let Some(waiting) = self.waiting.as_mut() {
                match waiting.as_mut().poll(cx) {
                    Poll::Ready(()) => self.waiting = None,
                    Poll::Pending => return Poll::Pending,
                }
                continue;
            }

            let requested = buf.remaining().min(MAX_CHUNK_BYTES).max(1) as u32;
            let cells = NonZeroU32::new(requested).expect("requested is clamped to >= 1");
            match self.limiter.check_n(cells) {
                Ok(Ok(())) => break,
                Ok(Err(_not_until)) => {
                    let limiter = self.limiter.clone();
                    self.waiting = Some(Box::pin(async move {
                        limiter.until_n_ready(cells).await.ok();
                    }));
                }
                Err(_insufficient_capacity) => {
                    // The burst size can't fit `cells` in one go; shrink the
                    // read window to the limiter's max burst and retry.
                    let mut shrunk = buf.take(MAX_CHUNK_BYTES);
                    let poll = Pin::new(&mut self.inner).poll_read(cx, &mut shrunk);
                    let n = shrunk.filled().len();
                    if let Poll::Ready(Ok(())) = &poll {
                        buf.advance(n);
                    }
                    return poll;
                }
            }
        }

        // Only throttle up to `requested` bytes this call so the permit
        // check above stays accurate; shrink the caller's buffer window.
        let mut limited = buf.take(MAX_CHUNK_BYTES);
        let poll = Pin::new(&mut self.inner).poll_read(cx, &mut limited);
        let n = limited.filled().len();
        if let Poll::Ready(Ok(())) = &poll {
            buf.advance(n);
        }
        poll
    }
}
