//! End-to-end composition over real TCP: an acceptor hands a channel to a
//! handler, the handler assembles inbound messages into invocations, a
//! skeleton dispatches them, and replies travel back as channel messages.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use dirmi::{
    AcceptListener, Acceptor, BufferedInput, Connection, MessageChannel, MessageReceiver,
    MethodId, ParamKind, RemoteInfo, RemoteMethod, RemoteTarget, Reply, RmiError, Skeleton,
    SkeletonFactory, Throwable, Value, wire,
};

// ---------------------------------------------------------------------------
// Test interface and server
// ---------------------------------------------------------------------------

const ADD: u16 = 0;
const DIV: u16 = 1;
const FIRE: u16 = 2;

fn add_id() -> MethodId {
    MethodId::derive("e2e.Calculator", "add", "(i32,i32)i32")
}

fn div_id() -> MethodId {
    MethodId::derive("e2e.Calculator", "div", "(i32,i32)i32")
}

fn fire_id() -> MethodId {
    MethodId::derive("e2e.Calculator", "fire", "(str)")
}

fn calculator_info() -> RemoteInfo {
    RemoteInfo::new(
        "e2e.Calculator",
        vec![
            RemoteMethod::new(
                "add",
                add_id(),
                vec![ParamKind::I32, ParamKind::I32],
                Some(ParamKind::I32),
            ),
            RemoteMethod::new(
                "div",
                div_id(),
                vec![ParamKind::I32, ParamKind::I32],
                Some(ParamKind::I32),
            ),
            RemoteMethod::new_async("fire", fire_id(), vec![ParamKind::Str]),
        ],
    )
    .unwrap()
}

#[derive(Default)]
struct CalculatorServer {
    fired: Mutex<Vec<String>>,
}

#[async_trait]
impl RemoteTarget for CalculatorServer {
    async fn invoke(
        &self,
        ordinal: u16,
        _method: &RemoteMethod,
        args: Vec<Value>,
    ) -> Result<Option<Value>, Throwable> {
        match ordinal {
            ADD => {
                let (Value::I32(a), Value::I32(b)) = (&args[0], &args[1]) else {
                    return Err(Throwable::new("TypeError", "expected i32 arguments"));
                };
                Ok(Some(Value::I32(a + b)))
            }
            DIV => {
                let (Value::I32(a), Value::I32(b)) = (&args[0], &args[1]) else {
                    return Err(Throwable::new("TypeError", "expected i32 arguments"));
                };
                if *b == 0 {
                    return Err(Throwable::new("ArithmeticError", "divide by zero"));
                }
                Ok(Some(Value::I32(a / b)))
            }
            FIRE => {
                let Value::Str(s) = &args[0] else {
                    return Err(Throwable::new("TypeError", "expected a string"));
                };
                self.fired.lock().unwrap().push(s.clone());
                Ok(None)
            }
            other => Err(Throwable::new("NoSuchOrdinal", other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Server-side wiring
// ---------------------------------------------------------------------------

/// Accept handler: every established channel gets an invocation receiver.
struct ServerListener {
    skeleton: Arc<Skeleton>,
}

#[async_trait]
impl AcceptListener for ServerListener {
    async fn established(&self, channel: Arc<MessageChannel>) {
        channel.receive(InvocationReceiver::boxed(Arc::clone(&self.skeleton)));
    }

    async fn closed(&self, _error: RmiError) {}
}

/// Assembles one inbound message, runs it through the skeleton, and sends
/// the reply frame (if any) back as a channel message.
struct InvocationReceiver {
    skeleton: Arc<Skeleton>,
    data: Vec<u8>,
}

impl InvocationReceiver {
    fn boxed(skeleton: Arc<Skeleton>) -> Box<Self> {
        Box::new(InvocationReceiver {
            skeleton,
            data: Vec::new(),
        })
    }
}

impl MessageReceiver for InvocationReceiver {
    fn receive(&mut self, _total: usize, _offset: usize, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    fn process(self: Box<Self>, channel: &Arc<MessageChannel>) {
        let channel = Arc::clone(channel);
        let InvocationReceiver { skeleton, data } = *self;
        tokio::spawn(async move {
            let mut conn = Connection::new(Cursor::new(data), Vec::new());
            if skeleton.invoke(&mut conn).await.is_ok() {
                let reply = conn.output().clone();
                if !reply.is_empty() {
                    let _ = channel.send(&reply).await;
                }
            }
            // Re-arm for the next invocation on this channel.
            channel.receive(InvocationReceiver::boxed(skeleton));
        });
    }

    fn closed(self: Box<Self>, _error: Option<Arc<RmiError>>) {}
}

/// Client-side receiver forwarding a whole reply message into a queue.
struct ReplyReceiver {
    data: Vec<u8>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl MessageReceiver for ReplyReceiver {
    fn receive(&mut self, _total: usize, _offset: usize, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    fn process(self: Box<Self>, _channel: &Arc<MessageChannel>) {
        let _ = self.tx.send(self.data);
    }

    fn closed(self: Box<Self>, _error: Option<Arc<RmiError>>) {}
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_server() -> (Acceptor, Arc<CalculatorServer>) {
    let factory = SkeletonFactory::new(calculator_info()).unwrap();
    let server = Arc::new(CalculatorServer::default());
    let skeleton = Arc::new(factory.skeleton(server.clone() as Arc<dyn RemoteTarget>));

    let acceptor = Acceptor::bind("127.0.0.1:0", 4096).await.unwrap();
    acceptor.accept(Arc::new(ServerListener { skeleton }));
    (acceptor, server)
}

async fn encode_call(id: MethodId, params: &[(ParamKind, Value)]) -> Vec<u8> {
    let mut frame = Vec::new();
    wire::write_method_id(&mut frame, id).await.unwrap();
    for (kind, value) in params {
        wire::write_param(&mut frame, kind, value).await.unwrap();
    }
    frame
}

async fn decode_reply(bytes: Vec<u8>, return_type: Option<&ParamKind>) -> Reply {
    let mut input = BufferedInput::new(Cursor::new(bytes));
    wire::read_reply(&mut input, return_type).await.unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_invocation_round_trips_over_tcp() {
    let (acceptor, _server) = start_server().await;
    let client = MessageChannel::connect(acceptor.local_addr(), 4096)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.receive(Box::new(ReplyReceiver {
        data: Vec::new(),
        tx,
    }));

    let call = encode_call(
        add_id(),
        &[
            (ParamKind::I32, Value::I32(2)),
            (ParamKind::I32, Value::I32(3)),
        ],
    )
    .await;
    client.send(&call).await.unwrap();

    let reply = decode_reply(rx.recv().await.unwrap(), Some(&ParamKind::I32)).await;
    assert_eq!(reply, Reply::Ok(Some(Value::I32(5))));
}

#[tokio::test]
async fn target_failure_arrives_as_a_throwable() {
    let (acceptor, _server) = start_server().await;
    let client = MessageChannel::connect(acceptor.local_addr(), 4096)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.receive(Box::new(ReplyReceiver {
        data: Vec::new(),
        tx,
    }));

    let call = encode_call(
        div_id(),
        &[
            (ParamKind::I32, Value::I32(1)),
            (ParamKind::I32, Value::I32(0)),
        ],
    )
    .await;
    client.send(&call).await.unwrap();

    let reply = decode_reply(rx.recv().await.unwrap(), Some(&ParamKind::I32)).await;
    assert_eq!(
        reply,
        Reply::Thrown(Throwable::new("ArithmeticError", "divide by zero"))
    );
}

/// A skeleton can also serve a raw stream directly: one invocation frame
/// in, one reply frame out, then the connection is closed.
#[tokio::test]
async fn skeleton_serves_a_raw_tcp_connection() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let factory = SkeletonFactory::new(calculator_info()).unwrap();
    let server = Arc::new(CalculatorServer::default());
    let skeleton = Arc::new(factory.skeleton(server as Arc<dyn RemoteTarget>));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut conn = Connection::new(reader, writer);
        skeleton.invoke(&mut conn).await.unwrap();
        assert!(conn.is_closed());
    });

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let call = encode_call(
        add_id(),
        &[
            (ParamKind::I32, Value::I32(40)),
            (ParamKind::I32, Value::I32(2)),
        ],
    )
    .await;
    stream.write_all(&call).await.unwrap();

    // The skeleton writes the reply and closes, so the stream drains to
    // end-of-file.
    let mut reply_bytes = Vec::new();
    stream.read_to_end(&mut reply_bytes).await.unwrap();
    let reply = decode_reply(reply_bytes, Some(&ParamKind::I32)).await;
    assert_eq!(reply, Reply::Ok(Some(Value::I32(42))));

    server_task.await.unwrap();
}

/// A fire-and-forget call produces no reply bytes at all: the next reply
/// the client sees belongs to the synchronous call sent after it.
#[tokio::test]
async fn async_invocation_sends_nothing_back() {
    let (acceptor, server) = start_server().await;
    let client = MessageChannel::connect(acceptor.local_addr(), 4096)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.receive(Box::new(ReplyReceiver {
        data: Vec::new(),
        tx,
    }));

    let fire = encode_call(fire_id(), &[(ParamKind::Str, Value::Str("hi".into()))]).await;
    client.send(&fire).await.unwrap();

    let add = encode_call(
        add_id(),
        &[
            (ParamKind::I32, Value::I32(20)),
            (ParamKind::I32, Value::I32(22)),
        ],
    )
    .await;
    client.send(&add).await.unwrap();

    // FIFO on the server side: fire ran first, silently; the single reply
    // is add's.
    let reply = decode_reply(rx.recv().await.unwrap(), Some(&ParamKind::I32)).await;
    assert_eq!(reply, Reply::Ok(Some(Value::I32(42))));
    assert_eq!(*server.fired.lock().unwrap(), vec!["hi".to_string()]);
}
