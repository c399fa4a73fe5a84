use thiserror::Error;

use crate::info::MethodId;
use crate::wire::Throwable;

/// Runtime errors raised by the dispatch engine and the channel layer.
#[derive(Debug, Error)]
pub enum RmiError {
    /// A malformed local call: zero-byte send, oversized send, and the like.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Peer-supplied bytes that do not parse: unknown tag, negative length,
    /// invalid UTF-8 or char scalar.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The decoded method identifier is not present in the method table.
    /// Raised to the caller of `invoke`; no reply is written.
    #[error("no such method: {0}")]
    NoSuchMethod(MethodId),

    /// Operation on a closed channel, or the peer closed mid-operation.
    #[error("connection closed")]
    Closed,

    /// A target method marked asynchronous failed. There is no reply frame
    /// to carry the error, so it surfaces here instead.
    #[error("asynchronous invocation failed: {0}")]
    AsyncInvocation(#[source] Throwable),

    /// Internal consistency failure while building or running a dispatcher,
    /// e.g. a target returning a value that contradicts its descriptor.
    #[error("invocation error: {0}")]
    Invocation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

pub type Result<T> = std::result::Result<T, RmiError>;
