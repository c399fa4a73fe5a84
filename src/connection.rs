//! The reader/writer pair a skeleton invocation consumes.
//!
//! A [`Connection`] is one invocation's view of a byte transport: a
//! [`BufferedInput`] on the inbound side and a raw writer on the outbound
//! side. Closing it shuts down the write direction (so the peer observes
//! end-of-stream) and closes the input. The dispatch engine closes the
//! connection itself after a synchronous reply; for asynchronous methods
//! the connection is left to its caller.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::input::{BufferedInput, InputSource};

pub struct Connection<R, W> {
    input: BufferedInput<R>,
    output: W,
    closed: bool,
}

impl<R, W> Connection<R, W>
where
    R: InputSource,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Connection {
            input: BufferedInput::new(reader),
            output: writer,
            closed: false,
        }
    }

    /// The buffered inbound half.
    pub fn input(&mut self) -> &mut BufferedInput<R> {
        &mut self.input
    }

    /// The raw outbound half.
    pub fn output(&mut self) -> &mut W {
        &mut self.output
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Idempotent. Shuts down the outbound half and closes the input.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.input.close();
        self.output.shutdown().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
