//! Wire codec for invocations and replies.
//!
//! ## Invocation frame (peer → skeleton)
//!
//! ```text
//! ┌──────────────────┬────────┬─────┬──────────┐
//! │ MethodId         │ param₀ │  …  │ paramₙ₋₁ │
//! │ (16 bytes)       │        │     │          │
//! └──────────────────┴────────┴─────┴──────────┘
//! ```
//!
//! ## Reply frame (skeleton → peer, synchronous methods only)
//!
//! ```text
//! OK                        void return
//! OK_TRUE | OK_FALSE        boolean return, folded into the tag
//! OK || value               any other return
//! THROWABLE || throwable    target failure
//! ```
//!
//! All multi-byte values are big-endian. Variable-length payloads (strings,
//! serialized objects, throwables) carry an `i32` byte-length prefix; a
//! negative length is a malformed frame. Serialized objects and throwables
//! are MessagePack. Asynchronous methods have no reply frame at all.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RmiError};
use crate::info::{MethodId, ParamKind};
use crate::input::{BufferedInput, InputSource};

// ---------------------------------------------------------------------------
// Reply tags
// ---------------------------------------------------------------------------

/// One-byte status tags opening a reply frame.
pub mod reply_tag {
    pub const OK: u8 = 0x00;
    pub const OK_TRUE: u8 = 0x01;
    pub const OK_FALSE: u8 = 0x02;
    pub const THROWABLE: u8 = 0x03;
}

/// Cap on variable-length payloads, to keep a hostile peer from forcing a
/// runaway allocation.
const MAX_PAYLOAD_SIZE: i32 = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A decoded parameter or return value. Each variant corresponds to one
/// [`ParamKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Char(char),
    Str(String),
    /// A serialized object, carried as MessagePack.
    Object(rmpv::Value),
    /// A remote reference: the peer-scoped object identifier.
    Remote(u64),
}

impl Value {
    /// Whether this value can be encoded under the given descriptor.
    pub fn matches(&self, kind: &ParamKind) -> bool {
        matches!(
            (self, kind),
            (Value::Bool(_), ParamKind::Bool)
                | (Value::Byte(_), ParamKind::Byte)
                | (Value::I16(_), ParamKind::I16)
                | (Value::U16(_), ParamKind::U16)
                | (Value::I32(_), ParamKind::I32)
                | (Value::I64(_), ParamKind::I64)
                | (Value::F32(_), ParamKind::F32)
                | (Value::F64(_), ParamKind::F64)
                | (Value::Char(_), ParamKind::Char)
                | (Value::Str(_), ParamKind::Str)
                | (Value::Object(_), ParamKind::Object)
                | (Value::Remote(_), ParamKind::Remote { .. })
        )
    }
}

// ---------------------------------------------------------------------------
// Throwable
// ---------------------------------------------------------------------------

/// A marshallable error thrown by a target method.
///
/// `kind` names the error class, `message` describes the instance, and
/// `cause` chains the underlying failure, if any. The wire encoding is
/// MessagePack with a length prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Throwable {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<Throwable>>,
}

impl Throwable {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Throwable {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn caused_by(mut self, cause: Throwable) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for Throwable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Throwable {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Read the method identifier opening an invocation frame.
pub async fn read_method_id<R: InputSource>(input: &mut BufferedInput<R>) -> Result<MethodId> {
    let mut bytes = [0u8; MethodId::LEN];
    input.read_exact(&mut bytes).await?;
    Ok(MethodId::from_bytes(bytes))
}

async fn read_len<R: InputSource>(input: &mut BufferedInput<R>) -> Result<usize> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes).await?;
    let len = i32::from_be_bytes(bytes);
    if len < 0 {
        return Err(RmiError::MalformedFrame(format!("negative length {len}")));
    }
    if len > MAX_PAYLOAD_SIZE {
        return Err(RmiError::MalformedFrame(format!(
            "payload of {len} bytes exceeds the {MAX_PAYLOAD_SIZE}-byte limit"
        )));
    }
    Ok(len as usize)
}

async fn read_payload<R: InputSource>(input: &mut BufferedInput<R>) -> Result<Vec<u8>> {
    let len = read_len(input).await?;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Decode one parameter according to its descriptor.
pub async fn read_param<R: InputSource>(
    input: &mut BufferedInput<R>,
    kind: &ParamKind,
) -> Result<Value> {
    match kind {
        ParamKind::Bool => match input.read_u8().await? {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            other => Err(RmiError::MalformedFrame(format!(
                "invalid boolean byte 0x{other:02x}"
            ))),
        },
        ParamKind::Byte => Ok(Value::Byte(input.read_u8().await?)),
        ParamKind::I16 => {
            let mut b = [0u8; 2];
            input.read_exact(&mut b).await?;
            Ok(Value::I16(i16::from_be_bytes(b)))
        }
        ParamKind::U16 => {
            let mut b = [0u8; 2];
            input.read_exact(&mut b).await?;
            Ok(Value::U16(u16::from_be_bytes(b)))
        }
        ParamKind::I32 => {
            let mut b = [0u8; 4];
            input.read_exact(&mut b).await?;
            Ok(Value::I32(i32::from_be_bytes(b)))
        }
        ParamKind::I64 => {
            let mut b = [0u8; 8];
            input.read_exact(&mut b).await?;
            Ok(Value::I64(i64::from_be_bytes(b)))
        }
        ParamKind::F32 => {
            let mut b = [0u8; 4];
            input.read_exact(&mut b).await?;
            Ok(Value::F32(f32::from_bits(u32::from_be_bytes(b))))
        }
        ParamKind::F64 => {
            let mut b = [0u8; 8];
            input.read_exact(&mut b).await?;
            Ok(Value::F64(f64::from_bits(u64::from_be_bytes(b))))
        }
        ParamKind::Char => {
            let mut b = [0u8; 4];
            input.read_exact(&mut b).await?;
            let scalar = u32::from_be_bytes(b);
            char::from_u32(scalar)
                .map(Value::Char)
                .ok_or_else(|| RmiError::MalformedFrame(format!("invalid char scalar {scalar:#x}")))
        }
        ParamKind::Str => {
            let bytes = read_payload(input).await?;
            String::from_utf8(bytes)
                .map(Value::Str)
                .map_err(|e| RmiError::MalformedFrame(format!("invalid UTF-8 string: {e}")))
        }
        ParamKind::Object => {
            let bytes = read_payload(input).await?;
            let value: rmpv::Value = rmp_serde::from_slice(&bytes)?;
            Ok(Value::Object(value))
        }
        ParamKind::Remote { .. } => {
            let mut b = [0u8; 8];
            input.read_exact(&mut b).await?;
            Ok(Value::Remote(u64::from_be_bytes(b)))
        }
    }
}

async fn read_throwable<R: InputSource>(input: &mut BufferedInput<R>) -> Result<Throwable> {
    let bytes = read_payload(input).await?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

/// A decoded synchronous reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Success; `None` for a void return.
    Ok(Option<Value>),
    /// The target threw.
    Thrown(Throwable),
}

/// Decode a reply frame, given the method's return descriptor (`None` for
/// void). This is the peer-side mirror of the skeleton's reply writer.
pub async fn read_reply<R: InputSource>(
    input: &mut BufferedInput<R>,
    return_type: Option<&ParamKind>,
) -> Result<Reply> {
    match input.read_u8().await? {
        reply_tag::OK => match return_type {
            None => Ok(Reply::Ok(None)),
            Some(ParamKind::Bool) => Err(RmiError::MalformedFrame(
                "boolean return must fold into the status tag".into(),
            )),
            Some(kind) => Ok(Reply::Ok(Some(read_param(input, kind).await?))),
        },
        reply_tag::OK_TRUE if return_type == Some(&ParamKind::Bool) => {
            Ok(Reply::Ok(Some(Value::Bool(true))))
        }
        reply_tag::OK_FALSE if return_type == Some(&ParamKind::Bool) => {
            Ok(Reply::Ok(Some(Value::Bool(false))))
        }
        reply_tag::THROWABLE => Ok(Reply::Thrown(read_throwable(input).await?)),
        other => Err(RmiError::MalformedFrame(format!(
            "unknown reply tag 0x{other:02x}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Write the method identifier opening an invocation frame. This is the
/// peer-side mirror of [`read_method_id`].
pub async fn write_method_id<W: AsyncWrite + Unpin>(writer: &mut W, id: MethodId) -> Result<()> {
    writer.write_all(id.as_bytes()).await?;
    Ok(())
}

async fn write_payload<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(RmiError::InvalidArgument(format!(
            "payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE}-byte limit",
            bytes.len()
        )));
    }
    writer.write_all(&(bytes.len() as i32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

/// Encode one parameter or return value under its descriptor.
pub async fn write_param<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: &ParamKind,
    value: &Value,
) -> Result<()> {
    match (kind, value) {
        (ParamKind::Bool, Value::Bool(v)) => writer.write_all(&[u8::from(*v)]).await?,
        (ParamKind::Byte, Value::Byte(v)) => writer.write_all(&[*v]).await?,
        (ParamKind::I16, Value::I16(v)) => writer.write_all(&v.to_be_bytes()).await?,
        (ParamKind::U16, Value::U16(v)) => writer.write_all(&v.to_be_bytes()).await?,
        (ParamKind::I32, Value::I32(v)) => writer.write_all(&v.to_be_bytes()).await?,
        (ParamKind::I64, Value::I64(v)) => writer.write_all(&v.to_be_bytes()).await?,
        (ParamKind::F32, Value::F32(v)) => writer.write_all(&v.to_bits().to_be_bytes()).await?,
        (ParamKind::F64, Value::F64(v)) => writer.write_all(&v.to_bits().to_be_bytes()).await?,
        (ParamKind::Char, Value::Char(v)) => {
            writer.write_all(&(*v as u32).to_be_bytes()).await?;
        }
        (ParamKind::Str, Value::Str(v)) => write_payload(writer, v.as_bytes()).await?,
        (ParamKind::Object, Value::Object(v)) => {
            let bytes = rmp_serde::to_vec(v)?;
            write_payload(writer, &bytes).await?;
        }
        (ParamKind::Remote { .. }, Value::Remote(v)) => {
            writer.write_all(&v.to_be_bytes()).await?;
        }
        (kind, value) => {
            return Err(RmiError::InvalidArgument(format!(
                "value {value:?} does not match descriptor {kind:?}"
            )));
        }
    }
    Ok(())
}

/// Write the `OK` status tag (void return, or prefix for a non-boolean
/// return value).
pub async fn write_ok<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(&[reply_tag::OK]).await?;
    Ok(())
}

/// Write a boolean return folded into the status tag. No payload byte
/// follows.
pub async fn write_ok_bool<W: AsyncWrite + Unpin>(writer: &mut W, value: bool) -> Result<()> {
    let tag = if value {
        reply_tag::OK_TRUE
    } else {
        reply_tag::OK_FALSE
    };
    writer.write_all(&[tag]).await?;
    Ok(())
}

/// Write a `THROWABLE` reply frame.
pub async fn write_throwable<W: AsyncWrite + Unpin>(
    writer: &mut W,
    thrown: &Throwable,
) -> Result<()> {
    writer.write_all(&[reply_tag::THROWABLE]).await?;
    let bytes = rmp_serde::to_vec_named(thrown)?;
    write_payload(writer, &bytes).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
