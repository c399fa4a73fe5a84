//! Close-on-error buffered byte reader used by the wire codec.
//!
//! [`BufferedInput`] wraps a transport's read half and feeds the codec one
//! value at a time. It has no mark/reset support. Its failure handling is
//! deliberately one-way: any I/O error from the source closes the stream
//! before the error is re-raised, and reading end-of-stream closes it as
//! well. A closed input never touches the transport again.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, RmiError};

/// A transport read half the codec can consume.
///
/// Beyond `AsyncRead`, a source may report how many bytes are readable
/// without blocking. Zero means "unknown"; a negative value means the
/// transport has been torn down and is treated as closed.
pub trait InputSource: AsyncRead + Unpin + Send {
    fn readable_hint(&self) -> i64 {
        0
    }
}

impl InputSource for tokio::net::tcp::OwnedReadHalf {}

impl InputSource for tokio::io::DuplexStream {}

impl<T: AsyncRead + Unpin + Send> InputSource for tokio::io::ReadHalf<T> {}

impl<T: AsRef<[u8]> + Unpin + Send> InputSource for io::Cursor<T> {
    fn readable_hint(&self) -> i64 {
        let total = self.get_ref().as_ref().len() as u64;
        total.saturating_sub(self.position()) as i64
    }
}

const DEFAULT_CAPACITY: usize = 8 * 1024;

/// Buffered reader over an [`InputSource`].
pub struct BufferedInput<R> {
    source: Option<R>,
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
}

impl<R: InputSource> BufferedInput<R> {
    pub fn new(source: R) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, source)
    }

    pub fn with_capacity(capacity: usize, source: R) -> Self {
        BufferedInput {
            source: Some(source),
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            pos: 0,
            cap: 0,
        }
    }

    /// Refill the internal buffer. Returns 0 on end-of-stream, which also
    /// closes the input.
    async fn fill(&mut self) -> io::Result<usize> {
        debug_assert_eq!(self.pos, self.cap);
        let Some(source) = self.source.as_mut() else {
            return Ok(0);
        };
        match source.read(&mut self.buf).await {
            Ok(0) => {
                self.close();
                Ok(0)
            }
            Ok(n) => {
                self.pos = 0;
                self.cap = n;
                Ok(n)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Read up to `out.len()` bytes. Returns 0 at end-of-stream or on a
    /// closed input.
    pub async fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos == self.cap {
            // Reads at least as large as the buffer bypass it.
            if out.len() >= self.buf.len() {
                let Some(source) = self.source.as_mut() else {
                    return Ok(0);
                };
                return match source.read(out).await {
                    Ok(0) => {
                        self.close();
                        Ok(0)
                    }
                    Ok(n) => Ok(n),
                    Err(e) => {
                        self.close();
                        Err(e)
                    }
                };
            }
            if self.fill().await? == 0 {
                return Ok(0);
            }
        }
        let n = (self.cap - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// Read a single byte, failing with `UnexpectedEof` at end-of-stream.
    pub async fn read_u8(&mut self) -> io::Result<u8> {
        if self.pos == self.cap && self.fill().await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Fill `out` completely, failing with `UnexpectedEof` if the stream
    /// ends first.
    pub async fn read_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read(&mut out[filled..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }
        Ok(())
    }

    /// Bytes readable without blocking: the buffered count plus the source's
    /// [`readable_hint`](InputSource::readable_hint). A negative hint means
    /// the transport is gone; the input closes and `Closed` is raised.
    pub fn available(&mut self) -> Result<usize> {
        let buffered = self.cap - self.pos;
        let Some(source) = self.source.as_ref() else {
            return Err(RmiError::Closed);
        };
        let hint = source.readable_hint();
        if hint < 0 {
            self.close();
            return Err(RmiError::Closed);
        }
        Ok(buffered + hint as usize)
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    /// Idempotent. Drops the source (closing the transport's read half) and
    /// discards any buffered bytes.
    pub fn close(&mut self) {
        self.source = None;
        self.pos = 0;
        self.cap = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
