//! Hash-indexed dispatch table built from a [`RemoteInfo`].
//!
//! Each method gets a [`DispatchEntry`] with a dense ordinal — a stable
//! small integer a server implementation can `match` on. Lookup goes
//! through the 32-bit id hash and resolves collisions by full [`MethodId`]
//! equality, so cost is O(1) plus a linear rescan of the (practically
//! singleton) collision group.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::error::{Result, RmiError};
use crate::info::{MethodId, RemoteInfo, RemoteMethod};

/// One dispatchable method: its id, its dense ordinal, and the descriptor
/// that drives argument decoding and reply encoding.
#[derive(Debug, Clone)]
pub struct DispatchEntry {
    id: MethodId,
    ordinal: u16,
    method: RemoteMethod,
}

impl DispatchEntry {
    pub fn id(&self) -> MethodId {
        self.id
    }

    /// Stable small integer identifying this method within its table.
    pub fn ordinal(&self) -> u16 {
        self.ordinal
    }

    pub fn method(&self) -> &RemoteMethod {
        &self.method
    }

    pub fn is_asynchronous(&self) -> bool {
        self.method.is_asynchronous()
    }
}

#[derive(Debug)]
enum HashSlot {
    Single(u16),
    Colliding(Vec<u16>),
}

/// Immutable mapping from `MethodId` to [`DispatchEntry`].
#[derive(Debug)]
pub struct MethodTable {
    entries: Box<[DispatchEntry]>,
    slots: HashMap<u32, HashSlot>,
}

impl MethodTable {
    /// Build the table. Methods are grouped by `hash32` in order of first
    /// appearance and ordinals are assigned in that group-iteration order,
    /// so the same `RemoteInfo` always yields the same ordinals.
    pub fn new(info: &RemoteInfo) -> Result<Self> {
        let methods = info.methods();
        if methods.len() > usize::from(u16::MAX) {
            return Err(RmiError::Invocation(format!(
                "remote interface {} has {} methods, more than a table can index",
                info.name(),
                methods.len()
            )));
        }

        let mut groups: Vec<(u32, Vec<usize>)> = Vec::new();
        let mut group_of: HashMap<u32, usize> = HashMap::new();
        for (index, method) in methods.iter().enumerate() {
            match group_of.entry(method.id().hash32()) {
                Entry::Occupied(slot) => groups[*slot.get()].1.push(index),
                Entry::Vacant(slot) => {
                    slot.insert(groups.len());
                    groups.push((method.id().hash32(), vec![index]));
                }
            }
        }

        let mut entries = Vec::with_capacity(methods.len());
        let mut slots = HashMap::with_capacity(groups.len());
        for (hash, members) in groups {
            let mut ordinals = Vec::with_capacity(members.len());
            for index in members {
                let method = methods[index].clone();
                let ordinal = entries.len() as u16;
                ordinals.push(ordinal);
                entries.push(DispatchEntry {
                    id: method.id(),
                    ordinal,
                    method,
                });
            }
            let slot = if let [only] = ordinals[..] {
                HashSlot::Single(only)
            } else {
                HashSlot::Colliding(ordinals)
            };
            slots.insert(hash, slot);
        }

        Ok(MethodTable {
            entries: entries.into(),
            slots,
        })
    }

    /// Resolve a method id. Equality is authoritative: a hash hit with a
    /// mismatched id is a miss.
    pub fn lookup(&self, id: &MethodId) -> Option<&DispatchEntry> {
        match self.slots.get(&id.hash32())? {
            HashSlot::Single(ordinal) => {
                let entry = &self.entries[usize::from(*ordinal)];
                (entry.id == *id).then_some(entry)
            }
            HashSlot::Colliding(ordinals) => ordinals
                .iter()
                .map(|&o| &self.entries[usize::from(o)])
                .find(|entry| entry.id == *id),
        }
    }

    /// All entries, in ordinal order.
    pub fn entries(&self) -> &[DispatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
