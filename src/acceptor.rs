//! One-shot server-side accept.
//!
//! An [`Acceptor`] binds a TCP listener once; each [`accept`] call arms a
//! single accept on a worker task. When a peer connects, the worker wraps
//! the stream in a [`MessageChannel`] and hands it to the caller's
//! [`AcceptListener`] — at most one channel per `accept` call. Re-arming
//! is explicit: call `accept` again for the next peer. Closing the
//! acceptor rejects armed accepts and releases the bound address; channels
//! that were already established are untouched.
//!
//! [`accept`]: Acceptor::accept

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::channel::MessageChannel;
use crate::error::{Result, RmiError};

/// Callbacks for one armed accept. Both run on a worker task.
#[async_trait]
pub trait AcceptListener: Send + Sync + 'static {
    /// A peer connected; `channel` is ready for traffic.
    async fn established(&self, channel: Arc<MessageChannel>);

    /// The accept failed, or the acceptor closed before a peer arrived.
    async fn closed(&self, error: RmiError);
}

pub struct Acceptor {
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    max_message_size: usize,
    shutdown: watch::Sender<bool>,
}

impl Acceptor {
    /// Bind the local address. Port 0 picks an ephemeral port;
    /// [`local_addr`](Acceptor::local_addr) reports the actual one.
    /// Channels established through this acceptor use `max_message_size`.
    pub async fn bind(addr: impl ToSocketAddrs, max_message_size: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        debug!(%local_addr, "acceptor bound");
        Ok(Acceptor {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            max_message_size,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Arm one accept. Returns immediately; the outcome reaches `listener`
    /// on a worker task — `established` with a fresh channel, or `closed`
    /// on failure or acceptor shutdown.
    pub fn accept(&self, listener: Arc<dyn AcceptListener>) {
        let socket = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(socket) = socket else {
            tokio::spawn(async move {
                listener.closed(RmiError::Closed).await;
            });
            return;
        };

        let mut shutdown = self.shutdown.subscribe();
        let max_message_size = self.max_message_size;
        tokio::spawn(async move {
            if *shutdown.borrow() {
                listener.closed(RmiError::Closed).await;
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => listener.closed(RmiError::Closed).await,
                accepted = socket.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let channel = MessageChannel::tcp(stream, max_message_size);
                        listener.established(channel).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        listener.closed(RmiError::Io(e)).await;
                    }
                }
            }
        });
    }

    /// Idempotent. Stops future accepts, fails armed ones with `Closed`,
    /// and releases the bound address.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageReceiver;
    use tokio::sync::mpsc;

    enum ListenerEvent {
        Established(Arc<MessageChannel>),
        Closed(RmiError),
    }

    struct QueueListener {
        tx: mpsc::UnboundedSender<ListenerEvent>,
    }

    #[async_trait]
    impl AcceptListener for QueueListener {
        async fn established(&self, channel: Arc<MessageChannel>) {
            let _ = self.tx.send(ListenerEvent::Established(channel));
        }

        async fn closed(&self, error: RmiError) {
            let _ = self.tx.send(ListenerEvent::Closed(error));
        }
    }

    fn listener() -> (Arc<QueueListener>, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(QueueListener { tx }), rx)
    }

    /// Forwards one inbound message into an mpsc queue.
    struct ForwardReceiver {
        data: Vec<u8>,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl MessageReceiver for ForwardReceiver {
        fn receive(&mut self, _total: usize, _offset: usize, chunk: &[u8]) {
            self.data.extend_from_slice(chunk);
        }

        fn process(self: Box<Self>, _channel: &Arc<MessageChannel>) {
            let _ = self.tx.send(self.data);
        }

        fn closed(self: Box<Self>, _error: Option<Arc<RmiError>>) {}
    }

    #[tokio::test]
    async fn accept_delivers_one_channel_and_rearms_explicitly() {
        let acceptor = Acceptor::bind("127.0.0.1:0", 256).await.unwrap();
        let addr = acceptor.local_addr();
        let (queue, mut events) = listener();

        // First armed accept.
        acceptor.accept(queue.clone());
        let client1 = MessageChannel::connect(addr, 256).await.unwrap();
        let server1 = match events.recv().await.unwrap() {
            ListenerEvent::Established(channel) => channel,
            ListenerEvent::Closed(e) => panic!("unexpected close: {e}"),
        };
        assert_eq!(server1.max_message_size(), 256);
        assert!(server1.peer_addr().is_some());

        // Traffic flows through the established channel.
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        server1.receive(Box::new(ForwardReceiver {
            data: Vec::new(),
            tx: msg_tx,
        }));
        client1.send(b"hello over tcp").await.unwrap();
        assert_eq!(msg_rx.recv().await.unwrap(), b"hello over tcp");

        // One accept, one channel: a second peer needs a second arm.
        acceptor.accept(queue.clone());
        let _client2 = MessageChannel::connect(addr, 256).await.unwrap();
        match events.recv().await.unwrap() {
            ListenerEvent::Established(_) => {}
            ListenerEvent::Closed(e) => panic!("unexpected close: {e}"),
        }
    }

    #[tokio::test]
    async fn close_rejects_a_pending_accept() {
        let acceptor = Acceptor::bind("127.0.0.1:0", 64).await.unwrap();
        let (queue, mut events) = listener();

        acceptor.accept(queue);
        acceptor.close();

        match events.recv().await.unwrap() {
            ListenerEvent::Closed(RmiError::Closed) => {}
            ListenerEvent::Closed(e) => panic!("expected Closed, got {e}"),
            ListenerEvent::Established(_) => panic!("accept should not complete"),
        }
    }

    #[tokio::test]
    async fn accept_after_close_reports_closed() {
        let acceptor = Acceptor::bind("127.0.0.1:0", 64).await.unwrap();
        acceptor.close();
        acceptor.close(); // idempotent

        let (queue, mut events) = listener();
        acceptor.accept(queue);
        match events.recv().await.unwrap() {
            ListenerEvent::Closed(RmiError::Closed) => {}
            _ => panic!("expected Closed"),
        }
    }

    #[tokio::test]
    async fn established_channels_survive_acceptor_close() {
        let acceptor = Acceptor::bind("127.0.0.1:0", 128).await.unwrap();
        let addr = acceptor.local_addr();
        let (queue, mut events) = listener();

        acceptor.accept(queue);
        let client = MessageChannel::connect(addr, 128).await.unwrap();
        let server = match events.recv().await.unwrap() {
            ListenerEvent::Established(channel) => channel,
            ListenerEvent::Closed(e) => panic!("unexpected close: {e}"),
        };

        acceptor.close();

        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        server.receive(Box::new(ForwardReceiver {
            data: Vec::new(),
            tx: msg_tx,
        }));
        client.send(b"still alive").await.unwrap();
        assert_eq!(msg_rx.recv().await.unwrap(), b"still alive");
    }
}
