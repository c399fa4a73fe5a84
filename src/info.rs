//! Remote interface descriptions consumed by the dispatch engine.
//!
//! A [`RemoteInfo`] is the immutable description of one remote interface:
//! its methods in definition order, each carrying a stable [`MethodId`],
//! parameter/return descriptors, and an asynchronous flag. The introspection
//! step that produces a `RemoteInfo` from a user type lives outside this
//! crate, behind the [`Introspector`] trait — this module only defines the
//! structure its output must have.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, RmiError};

// ---------------------------------------------------------------------------
// MethodId
// ---------------------------------------------------------------------------

/// Opaque, stable identifier for one remote method.
///
/// Sixteen bytes, totally ordered, with a stable 32-bit hash ([`hash32`]).
/// Two ids compare equal only if they refer to the same remote method;
/// `hash32` collisions are legal and resolved by full equality in the
/// method table.
///
/// [`hash32`]: MethodId::hash32
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId([u8; 16]);

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl MethodId {
    /// Encoded length on the wire, in bytes.
    pub const LEN: usize = 16;

    /// Adopt an identifier chosen by an introspector as-is.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        MethodId(bytes)
    }

    /// Derive a deterministic identifier from an interface name, a method
    /// name, and a signature string distinguishing overloads.
    ///
    /// The same three inputs always yield the same id, across processes and
    /// releases.
    pub fn derive(interface: &str, method: &str, signature: &str) -> Self {
        let mut hi = FNV_OFFSET;
        for part in [interface, method, signature] {
            hi = fnv1a(hi, part.as_bytes());
            // Separator so ("ab","c") and ("a","bc") diverge.
            hi = fnv1a(hi, &[0xff]);
        }
        let lo = fnv1a(hi, &hi.to_be_bytes());

        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..].copy_from_slice(&lo.to_be_bytes());
        MethodId(bytes)
    }

    /// The stable 32-bit hash used to index the method table: the big-endian
    /// value of the first four bytes.
    pub fn hash32(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// The raw identifier bytes, as encoded on the wire.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodId({self})")
    }
}

// ---------------------------------------------------------------------------
// Parameter descriptors
// ---------------------------------------------------------------------------

/// Describes one parameter or return value of a remote method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Byte,
    I16,
    U16,
    I32,
    I64,
    F32,
    F64,
    Char,
    /// UTF-8 string.
    Str,
    /// Serialized object; carried as a MessagePack value on the wire.
    Object,
    /// Reference to another remote object, tagged with the remote interface
    /// it implements.
    Remote { interface: String },
}

// ---------------------------------------------------------------------------
// RemoteMethod
// ---------------------------------------------------------------------------

/// One method of a remote interface.
///
/// Names may repeat across methods (overloads); the [`MethodId`] is what
/// distinguishes them.
#[derive(Debug, Clone)]
pub struct RemoteMethod {
    name: Arc<str>,
    id: MethodId,
    parameters: Arc<[ParamKind]>,
    return_type: Option<ParamKind>,
    asynchronous: bool,
}

impl RemoteMethod {
    /// A synchronous method. `return_type` of `None` means void.
    pub fn new(
        name: impl Into<Arc<str>>,
        id: MethodId,
        parameters: Vec<ParamKind>,
        return_type: Option<ParamKind>,
    ) -> Self {
        RemoteMethod {
            name: name.into(),
            id,
            parameters: parameters.into(),
            return_type,
            asynchronous: false,
        }
    }

    /// An asynchronous (fire-and-forget) method. No reply frame is ever
    /// written for it; any return value the target produces is discarded.
    pub fn new_async(name: impl Into<Arc<str>>, id: MethodId, parameters: Vec<ParamKind>) -> Self {
        RemoteMethod {
            name: name.into(),
            id,
            parameters: parameters.into(),
            return_type: None,
            asynchronous: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    /// Parameter descriptors, in declaration order.
    pub fn parameters(&self) -> &[ParamKind] {
        &self.parameters
    }

    /// `None` for void.
    pub fn return_type(&self) -> Option<&ParamKind> {
        self.return_type.as_ref()
    }

    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }
}

// ---------------------------------------------------------------------------
// RemoteInfo
// ---------------------------------------------------------------------------

/// The immutable set of methods of one remote interface, in definition
/// order.
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    name: Arc<str>,
    methods: Arc<[RemoteMethod]>,
}

impl RemoteInfo {
    /// Build a `RemoteInfo`, validating that method ids are pairwise
    /// distinct. Overloaded names are fine.
    pub fn new(name: impl Into<Arc<str>>, methods: Vec<RemoteMethod>) -> Result<Self> {
        let name = name.into();
        let mut seen = HashSet::with_capacity(methods.len());
        for method in &methods {
            if !seen.insert(method.id()) {
                return Err(RmiError::Invocation(format!(
                    "duplicate method id {} in remote interface {name}",
                    method.id()
                )));
            }
        }
        Ok(RemoteInfo {
            name,
            methods: methods.into(),
        })
    }

    /// The remote interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Methods in definition order.
    pub fn methods(&self) -> &[RemoteMethod] {
        &self.methods
    }
}

// ---------------------------------------------------------------------------
// Introspector
// ---------------------------------------------------------------------------

/// External collaborator that turns a remote type into its [`RemoteInfo`].
///
/// How remote types are declared and discovered is out of scope here; the
/// skeleton factory cache only needs this one operation.
pub trait Introspector: Send + Sync {
    fn examine(&self, remote_type: &str) -> Result<RemoteInfo>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
