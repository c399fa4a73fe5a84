//! Server-side dispatch: skeletons and their factory cache.
//!
//! A [`Skeleton`] is the server-side dispatcher for one remote interface:
//! it reads a method identifier and arguments off a connection, invokes the
//! bound [`RemoteTarget`], and writes the reply — or a marshalled
//! throwable — back. [`SkeletonFactory`] binds the interface's
//! [`MethodTable`] once and stamps out skeletons per server instance;
//! factories are memoized process-wide in a weak-valued cache so unused
//! ones can be reclaimed.
//!
//! Reply rules differ by method flavor:
//!
//! - **synchronous**: success writes `OK`/`OK_TRUE`/`OK_FALSE` (+ value),
//!   failure writes `THROWABLE` + the error; either way the connection is
//!   then closed.
//! - **asynchronous**: nothing is ever written and the connection is left
//!   open — the target may have taken it over for streaming. A failure is
//!   wrapped as [`RmiError::AsyncInvocation`] and raised to the caller,
//!   since no reply path exists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::connection::Connection;
use crate::error::{Result, RmiError};
use crate::info::{Introspector, ParamKind, RemoteInfo, RemoteMethod};
use crate::input::InputSource;
use crate::table::MethodTable;
use crate::wire::{self, Throwable, Value};

// ---------------------------------------------------------------------------
// The server seam
// ---------------------------------------------------------------------------

/// A server object invocable through a skeleton.
///
/// `ordinal` is the method's stable ordinal from the [`MethodTable`], so an
/// implementation dispatches with a dense `match`. Void methods return
/// `Ok(None)`; a thrown [`Throwable`] becomes the reply for synchronous
/// methods.
#[async_trait]
pub trait RemoteTarget: Send + Sync {
    async fn invoke(
        &self,
        ordinal: u16,
        method: &RemoteMethod,
        args: Vec<Value>,
    ) -> std::result::Result<Option<Value>, Throwable>;
}

// ---------------------------------------------------------------------------
// SkeletonFactory
// ---------------------------------------------------------------------------

/// Per-interface factory: owns the [`RemoteInfo`] and its dispatch table,
/// and produces a [`Skeleton`] per server instance.
pub struct SkeletonFactory {
    info: RemoteInfo,
    table: MethodTable,
}

impl SkeletonFactory {
    pub fn new(info: RemoteInfo) -> Result<Arc<Self>> {
        let table = MethodTable::new(&info)?;
        Ok(Arc::new(SkeletonFactory { info, table }))
    }

    pub fn remote_info(&self) -> &RemoteInfo {
        &self.info
    }

    pub fn table(&self) -> &MethodTable {
        &self.table
    }

    /// Bind a server instance. The skeleton keeps the factory alive for as
    /// long as it lives.
    pub fn skeleton(self: &Arc<Self>, target: Arc<dyn RemoteTarget>) -> Skeleton {
        Skeleton {
            factory: Arc::clone(self),
            target,
        }
    }
}

// ---------------------------------------------------------------------------
// Factory cache
// ---------------------------------------------------------------------------

static FACTORIES: OnceLock<Mutex<HashMap<String, Weak<SkeletonFactory>>>> = OnceLock::new();

/// Memoized factory lookup, keyed by remote type.
///
/// The cache holds weak references: once nothing else retains a factory it
/// may be reclaimed, and a later call re-examines the type. Misses
/// synthesize the factory under the cache lock, so racing callers observe
/// one instance during any overlapping lifetime.
pub fn skeleton_factory_for(
    remote_type: &str,
    introspector: &dyn Introspector,
) -> Result<Arc<SkeletonFactory>> {
    let cache = FACTORIES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
    cache.retain(|_, weak| weak.strong_count() > 0);

    if let Some(factory) = cache.get(remote_type).and_then(Weak::upgrade) {
        return Ok(factory);
    }

    let info = introspector.examine(remote_type)?;
    let factory = SkeletonFactory::new(info)?;
    cache.insert(remote_type.to_string(), Arc::downgrade(&factory));
    Ok(factory)
}

// ---------------------------------------------------------------------------
// Skeleton
// ---------------------------------------------------------------------------

/// The dispatcher for one (interface, server instance) pair. Stateless
/// between invocations; reentrant as long as each invocation has its own
/// connection.
pub struct Skeleton {
    factory: Arc<SkeletonFactory>,
    target: Arc<dyn RemoteTarget>,
}

impl Skeleton {
    /// Serve one invocation from `conn`.
    ///
    /// An unknown method id raises [`RmiError::NoSuchMethod`] with nothing
    /// written; the caller owns recovery of the connection. Synchronous
    /// methods end with the connection closed, even when writing the reply
    /// failed. Asynchronous methods leave the connection untouched.
    pub async fn invoke<R, W>(&self, conn: &mut Connection<R, W>) -> Result<()>
    where
        R: InputSource,
        W: AsyncWrite + Unpin + Send,
    {
        let id = wire::read_method_id(conn.input()).await?;
        let entry = self
            .factory
            .table()
            .lookup(&id)
            .ok_or(RmiError::NoSuchMethod(id))?;
        let method = entry.method();

        let mut args = Vec::with_capacity(method.parameters().len());
        for kind in method.parameters() {
            args.push(wire::read_param(conn.input(), kind).await?);
        }

        trace!(
            method = method.name(),
            ordinal = entry.ordinal(),
            "dispatching invocation"
        );
        let outcome = self.target.invoke(entry.ordinal(), method, args).await;

        if method.is_asynchronous() {
            return match outcome {
                // Any return value is discarded; no reply frame exists.
                Ok(_) => Ok(()),
                Err(thrown) => Err(RmiError::AsyncInvocation(thrown)),
            };
        }

        let written = match outcome {
            Ok(ret) => write_reply(conn.output(), method.return_type(), ret).await,
            Err(thrown) => wire::write_throwable(conn.output(), &thrown).await,
        };
        let written = match written {
            Ok(()) => conn.output().flush().await.map_err(RmiError::from),
            err => err,
        };
        // The connection is closed no matter how the reply write went.
        let closed = conn.close().await;
        written?;
        closed?;
        Ok(())
    }
}

/// Encode a successful synchronous reply under the return descriptor.
async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    return_type: Option<&ParamKind>,
    ret: Option<Value>,
) -> Result<()> {
    match (return_type, ret) {
        (None, None) => wire::write_ok(writer).await,
        (Some(ParamKind::Bool), Some(Value::Bool(b))) => wire::write_ok_bool(writer, b).await,
        (Some(kind), Some(value)) if value.matches(kind) => {
            wire::write_ok(writer).await?;
            wire::write_param(writer, kind, &value).await
        }
        (None, Some(value)) => Err(RmiError::Invocation(format!(
            "void method returned a value: {value:?}"
        ))),
        (Some(kind), None) => Err(RmiError::Invocation(format!(
            "method declared to return {kind:?} returned nothing"
        ))),
        (Some(kind), Some(value)) => Err(RmiError::Invocation(format!(
            "return value {value:?} does not match descriptor {kind:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
