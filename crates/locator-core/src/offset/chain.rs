//! Pointer chains: a base address plus an ordered list of offsets

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::memory::{Address, ReadMemory};

/// Outcome of resolving a [`Chain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Address(Address),
    Unresolved,
}

impl Resolved {
    pub fn address(self) -> Option<Address> {
        match self {
            Resolved::Address(address) => Some(address),
            Resolved::Unresolved => None,
        }
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, Resolved::Address(_))
    }
}

/// Multi-level indirection path from a base address to a field.
///
/// Every offset but the last is followed by a pointer-sized dereference;
/// the last is only added. A chain found on one instance is replayed on
/// another by [`rebase`](Chain::rebase).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chain {
    #[serde(default)]
    pub base: Address,
    pub offsets: Vec<u32>,
}

impl Chain {
    pub fn new(base: Address, offsets: impl Into<Vec<u32>>) -> Self {
        Self {
            base,
            offsets: offsets.into(),
        }
    }

    /// Chain with no base, as produced by the template scanner
    pub fn template(offsets: impl Into<Vec<u32>>) -> Self {
        Self::new(0, offsets)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn last(&self) -> Option<u32> {
        self.offsets.last().copied()
    }

    pub fn push(&mut self, offset: u32) {
        self.offsets.push(offset);
    }

    /// This chain followed by `offsets`
    pub fn join(&self, offsets: &[u32]) -> Self {
        let mut joined = self.clone();
        joined.offsets.extend_from_slice(offsets);
        joined
    }

    /// Same offsets, different base
    pub fn rebase(&self, base: Address) -> Self {
        Self {
            base,
            offsets: self.offsets.clone(),
        }
    }

    /// Chain reaching an adjacent field: `delta` added to the final offset only.
    ///
    /// Returns `None` for an empty chain or when the offset leaves `u32` range.
    pub fn sibling(&self, delta: i64) -> Option<Self> {
        let last = self.last()?;
        let moved = u32::try_from(i64::from(last).checked_add(delta)?).ok()?;
        let mut sibling = self.clone();
        if let Some(slot) = sibling.offsets.last_mut() {
            *slot = moved;
        }
        Some(sibling)
    }

    /// Resolve against `memory`.
    ///
    /// Levels `0..n-1` are dereferenced; the final offset is added without a
    /// dereference. Any failed read yields [`Resolved::Unresolved`].
    pub fn resolve<R: ReadMemory + ?Sized>(&self, memory: &R) -> Resolved {
        let width = memory.pointer_width();
        let Some((last, inner)) = self.offsets.split_last() else {
            return Resolved::Address(self.base);
        };

        let mut current = self.base;
        for &offset in inner {
            match memory.try_read_ptr(width.offset(current, offset)) {
                Some(next) => current = next,
                None => return Resolved::Unresolved,
            }
        }
        Resolved::Address(width.offset(current, *last))
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X} -> [", self.base)?;
        for (i, offset) in self.offsets.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "0x{:X}", offset)?;
        }
        write!(f, "]")
    }
}
