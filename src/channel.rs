//! Framed message channel with pipelined FIFO receive.
//!
//! ## Wire format
//!
//! Every message is length-prefixed:
//!
//! ```text
//! ┌──────────────────┬───────────────────────────┐
//! │ 4 bytes BE u32   │  payload                  │
//! │ (payload length) │  (1..=max_message_size)   │
//! └──────────────────┴───────────────────────────┘
//! ```
//!
//! A prefix of zero or above the channel's limit is a malformed frame and
//! terminates the channel.
//!
//! ## Delivery model
//!
//! Receivers are queued with [`MessageChannel::receive`] and consumed in
//! FIFO order: the Nth registered receiver observes the Nth inbound
//! message. A single reader task drains one message at a time, handing the
//! head receiver successive payload chunks (`receive`) and then exactly one
//! completion (`process`) — or exactly one `closed` if the channel
//! terminates while the receiver is still queued. Outbound `send` calls
//! serialize on a writer lock, so a frame is never interleaved with
//! another sender's bytes.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, trace};

use crate::error::{Result, RmiError};

/// Two-stage callback consuming one inbound message.
///
/// `receive` is called one or more times with successive chunks covering
/// `[offset, offset + chunk.len())` of a `total`-byte message; the receiver
/// threads its own accumulator state between calls. After the final chunk,
/// `process` runs exactly once. If the channel terminates while the
/// receiver is still queued (or mid-message), `closed` runs exactly once
/// instead, with the termination reason (`None` for a clean close).
pub trait MessageReceiver: Send + 'static {
    fn receive(&mut self, total: usize, offset: usize, chunk: &[u8]);

    fn process(self: Box<Self>, channel: &Arc<MessageChannel>);

    fn closed(self: Box<Self>, error: Option<Arc<RmiError>>);
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Chunk granularity of the inbound delivery path.
const READ_CHUNK: usize = 4096;

/// A bidirectional framed message transport over a byte stream.
pub struct MessageChannel {
    writer: Mutex<Option<BoxedWriter>>,
    pending: mpsc::UnboundedSender<Box<dyn MessageReceiver>>,
    max_message_size: usize,
    closed: AtomicBool,
    close_reason: std::sync::Mutex<Option<Arc<RmiError>>>,
    shutdown: watch::Sender<bool>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl MessageChannel {
    /// Wrap a reader/writer pair. The channel takes ownership of both
    /// halves; closing the channel closes the transport.
    pub fn new<R, W>(reader: R, writer: W, max_message_size: usize) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::build(reader, writer, max_message_size, None, None)
    }

    /// Wrap an established TCP stream, capturing its addresses.
    pub fn tcp(stream: TcpStream, max_message_size: usize) -> Arc<Self> {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::build(reader, writer, max_message_size, local_addr, peer_addr)
    }

    /// Dial a peer and wrap the resulting stream.
    pub async fn connect(addr: impl ToSocketAddrs, max_message_size: usize) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::tcp(stream, max_message_size))
    }

    fn build<R, W>(
        reader: R,
        writer: W,
        max_message_size: usize,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let channel = Arc::new(MessageChannel {
            writer: Mutex::new(Some(Box::new(writer))),
            pending: pending_tx,
            max_message_size,
            closed: AtomicBool::new(false),
            close_reason: std::sync::Mutex::new(None),
            shutdown: shutdown_tx,
            local_addr,
            peer_addr,
        });
        tokio::spawn(read_loop(
            Arc::downgrade(&channel),
            reader,
            pending_rx,
            shutdown_rx,
            max_message_size,
        ));
        channel
    }

    /// Largest payload this channel accepts, per message.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Transmit one whole message. Blocks only on transport backpressure;
    /// concurrent senders serialize, so the peer never observes a partial
    /// frame. A concurrent [`close`](MessageChannel::close) unblocks a
    /// stalled send with `Closed`.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(RmiError::InvalidArgument("cannot send an empty message".into()));
        }
        if payload.len() > self.max_message_size {
            return Err(RmiError::InvalidArgument(format!(
                "message of {} bytes exceeds the {}-byte channel limit",
                payload.len(),
                self.max_message_size
            )));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(RmiError::Closed);
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(RmiError::Closed)?;
        let result: io::Result<()> = tokio::select! {
            // Abandon a write stalled on backpressure when the channel
            // closes; the transport is torn down right after.
            _ = shutdown.changed() => return Err(RmiError::Closed),
            res = async {
                writer
                    .write_all(&(payload.len() as u32).to_be_bytes())
                    .await?;
                writer.write_all(payload).await?;
                writer.flush().await
            } => res,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                // A broken transport ends the channel.
                guard.take();
                drop(guard);
                self.note_closed(Some(Arc::new(RmiError::Io(io::Error::new(
                    e.kind(),
                    e.to_string(),
                )))));
                let _ = self.shutdown.send(true);
                Err(RmiError::Io(e))
            }
        }
    }

    /// Queue a receiver for the next undelivered inbound message. Never
    /// blocks. On a channel that has already terminated, the receiver's
    /// `closed` fires immediately with the stored reason.
    pub fn receive(&self, receiver: Box<dyn MessageReceiver>) {
        if self.closed.load(Ordering::SeqCst) {
            receiver.closed(self.close_reason());
            return;
        }
        if let Err(rejected) = self.pending.send(receiver) {
            // The reader task is already gone.
            rejected.0.closed(self.close_reason());
        }
    }

    /// Terminate both directions. Sends no frame. Idempotent. Every
    /// still-queued receiver observes `closed` exactly once.
    pub async fn close(&self) {
        self.note_closed(None);
        let _ = self.shutdown.send(true);
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
    }

    fn note_closed(&self, reason: Option<Arc<RmiError>>) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self
                .close_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = reason;
        }
    }

    fn close_reason(&self) -> Option<Arc<RmiError>> {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

/// Drain inbound frames, one receiver per message, until the transport or
/// the channel goes away.
async fn read_loop<R>(
    channel: Weak<MessageChannel>,
    mut reader: R,
    mut pending: mpsc::UnboundedReceiver<Box<dyn MessageReceiver>>,
    mut shutdown: watch::Receiver<bool>,
    max_message_size: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let outcome: Option<Arc<RmiError>> = loop {
        // Frame prefix. A clean end-of-stream here is a normal close.
        let mut prefix = [0u8; 4];
        tokio::select! {
            _ = shutdown.changed() => break None,
            res = reader.read_exact(&mut prefix) => match res {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    trace!("peer closed the channel");
                    break None;
                }
                Err(e) => break Some(Arc::new(RmiError::Io(e))),
            }
        }

        let total = u32::from_be_bytes(prefix) as usize;
        if total == 0 || total > max_message_size {
            break Some(Arc::new(RmiError::MalformedFrame(format!(
                "message length {total} outside 1..={max_message_size}"
            ))));
        }

        // Head of the FIFO. Registration may lag arrival; wait for it.
        let mut receiver = tokio::select! {
            _ = shutdown.changed() => break None,
            queued = pending.recv() => match queued {
                Some(r) => r,
                // Channel dropped with no receivers left to serve.
                None => break None,
            }
        };

        // Stream the payload through the receiver in chunks.
        let mut offset = 0usize;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut aborted: Option<Option<Arc<RmiError>>> = None;
        while offset < total {
            buf.clear();
            let want = (total - offset).min(READ_CHUNK);
            let mut limited = (&mut reader).take(want as u64);
            let read = tokio::select! {
                _ = shutdown.changed() => {
                    aborted = Some(None);
                    break;
                }
                res = limited.read_buf(&mut buf) => res,
            };
            match read {
                // Peer closed mid-message.
                Ok(0) => {
                    aborted = Some(Some(Arc::new(RmiError::Closed)));
                    break;
                }
                Ok(n) => {
                    receiver.receive(total, offset, &buf[..n]);
                    offset += n;
                }
                Err(e) => {
                    aborted = Some(Some(Arc::new(RmiError::Io(e))));
                    break;
                }
            }
        }
        if let Some(reason) = aborted {
            receiver.closed(reason.clone());
            break reason;
        }

        match channel.upgrade() {
            Some(channel) => receiver.process(&channel),
            None => {
                receiver.closed(None);
                break None;
            }
        }
    };

    if let Some(err) = &outcome {
        debug!(error = %err, "message channel terminated");
    }

    // Record the reason and tear the transport down before notifying, so
    // late registrations observe the closed state.
    let reason = match channel.upgrade() {
        Some(channel) => {
            channel.note_closed(outcome.clone());
            let mut writer = channel.writer.lock().await;
            if let Some(mut w) = writer.take() {
                let _ = w.shutdown().await;
            }
            drop(writer);
            channel.close_reason()
        }
        None => outcome,
    };

    // Every still-queued receiver observes `closed` exactly once.
    pending.close();
    while let Some(receiver) = pending.recv().await {
        receiver.closed(reason.clone());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
