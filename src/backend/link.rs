//! SerialLink trait for byte transports
//!
//! This module provides the common trait for everything the two polling loops
//! read from and write to: real serial ports (see [`serial`](super::serial))
//! and the in-memory simulators used for testing.
//!
//! A read that times out is not an error for the loops. [`FrameReader`] turns
//! `TimedOut`/`WouldBlock` and zero-length reads into "no data yet" and keeps
//! any partial frame buffered for the next attempt.

use crate::error::Result;
use std::io::{self, Read, Write};

/// Bidirectional byte link to a device
pub trait SerialLink: Read + Write + Send {
    /// Independent handle to the same link, used to split reading and writing
    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>>;

    /// Human readable name for logs
    fn describe(&self) -> String;
}

impl SerialLink for Box<dyn SerialLink> {
    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>> {
        (**self).try_clone_link()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

const READ_CHUNK: usize = 512;

/// Buffered reader of fixed-length frames
pub struct FrameReader<R> {
    inner: R,
    pending: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    /// Read until at least `len` bytes are buffered
    ///
    /// Returns `Ok(false)` when the underlying read timed out first.
    pub fn fill(&mut self, len: usize) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.pending.len() < len {
            let wanted = (len - self.pending.len()).min(READ_CHUNK);
            match self.inner.read(&mut chunk[..wanted]) {
                Ok(0) => return Ok(false),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Read exactly `len` bytes, or `None` if the read timed out
    ///
    /// Bytes received before a timeout stay buffered.
    pub fn read_frame(&mut self, len: usize) -> io::Result<Option<Vec<u8>>> {
        if self.fill(len)? {
            Ok(Some(self.take(len)))
        } else {
            Ok(None)
        }
    }

    /// Buffered bytes not yet consumed
    pub fn buffered(&self) -> &[u8] {
        &self.pending
    }

    /// Remove and return the first `len` buffered bytes
    pub fn take(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.pending.len());
        self.pending.drain(..len).collect()
    }

    /// Drop the first `count` buffered bytes
    pub fn discard(&mut self, count: usize) {
        let count = count.min(self.pending.len());
        self.pending.drain(..count);
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl<R: Write> FrameReader<R> {
    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.inner.flush()
    }
}

/// Whether an I/O error only means "nothing arrived in time"
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}
