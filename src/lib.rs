//! dirmi — bidirectional RMI runtime core.
//!
//! Two tightly coupled subsystems make up this crate:
//!
//! 1. **Skeleton dispatch** ([`skeleton`], [`table`], [`wire`], [`info`]):
//!    given the description of a remote interface ([`RemoteInfo`]), a
//!    [`SkeletonFactory`] builds a hash-indexed, collision-tolerant
//!    [`MethodTable`] once, and stamps out a [`Skeleton`] per server
//!    instance. `Skeleton::invoke` reads a [`MethodId`] and typed
//!    arguments off a [`Connection`], calls the bound [`RemoteTarget`] by
//!    its dense ordinal, and writes the reply — a status tag plus return
//!    value for synchronous methods (boolean returns fold into the tag),
//!    a marshalled [`Throwable`] on failure, nothing at all for
//!    asynchronous methods.
//!
//! 2. **Message channels** ([`channel`], [`acceptor`], [`input`]): a
//!    [`MessageChannel`] frames fixed-maximum-size messages over a byte
//!    transport and delivers them to queued [`MessageReceiver`]s in strict
//!    FIFO order, one message fully drained before the next. An
//!    [`Acceptor`] arms one accept at a time and hands each established
//!    channel to an [`AcceptListener`]; re-arming is explicit.
//!
//! The harness composes the two: a channel receiver assembles an inbound
//! message, feeds it to the skeleton as an invocation, and sends the reply
//! frame back over the channel.

pub mod acceptor;
pub mod channel;
pub mod connection;
pub mod error;
pub mod info;
pub mod input;
pub mod skeleton;
pub mod table;
pub mod wire;

pub use acceptor::{AcceptListener, Acceptor};
pub use channel::{MessageChannel, MessageReceiver};
pub use connection::Connection;
pub use error::{Result, RmiError};
pub use info::{Introspector, MethodId, ParamKind, RemoteInfo, RemoteMethod};
pub use input::{BufferedInput, InputSource};
pub use skeleton::{RemoteTarget, Skeleton, SkeletonFactory, skeleton_factory_for};
pub use table::{DispatchEntry, MethodTable};
pub use wire::{Reply, Throwable, Value};
