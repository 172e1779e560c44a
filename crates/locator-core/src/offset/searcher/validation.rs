//! Leaf predicates and cross-sample verification
//!
//! A scanner only narrows the search space; a chain is trusted once it
//! resolves to the expected contents on every sample of a diverse pool.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::constants::{MAX_STRING_LEN, MIN_POOL_SIZE};
use crate::error::{Error, Result};
use crate::memory::{Address, ReadMemory, ScalarKind, StringEncoding};
use crate::offset::{Chain, Resolved};
use crate::sample::{Sample, SampleKey};

/// Predicate on the contents at a resolved address.
///
/// Expected values either are constants or come from the sample's trusted
/// anchors, so one check verifies every sample against its own truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum LeafCheck {
    /// The pointer stored here is non-null
    NonNull,
    /// `len` bytes starting here are readable
    Readable { len: usize },
    /// The scalar stored here equals a constant
    Equals { value: u64, scalar: ScalarKind },
    /// The scalar stored here equals the sample's anchor
    EqualsAnchor { anchor: String, scalar: ScalarKind },
    /// A string starting here equals the sample's text anchor
    Text {
        anchor: String,
        encoding: StringEncoding,
    },
    /// The pointer stored here is non-null and a multiple of `align`
    Aligned { align: u64 },
    /// Follow the non-null pointer stored here, then check the target
    Deref { then: Box<LeafCheck> },
    /// Move by `offset` bytes without reading, then check
    At { offset: i64, then: Box<LeafCheck> },
    All { checks: Vec<LeafCheck> },
}

/// What a check may look at
pub struct CheckContext<'a, R: ReadMemory + ?Sized> {
    pub memory: &'a R,
    pub sample: &'a Sample,
    pub max_string_len: usize,
}

impl LeafCheck {
    pub fn deref(then: LeafCheck) -> Self {
        LeafCheck::Deref {
            then: Box::new(then),
        }
    }

    pub fn at(offset: i64, then: LeafCheck) -> Self {
        LeafCheck::At {
            offset,
            then: Box::new(then),
        }
    }

    pub fn equals_u32(value: u32) -> Self {
        LeafCheck::Equals {
            value: value as u64,
            scalar: ScalarKind::U32,
        }
    }

    pub fn anchor_ptr(anchor: &str) -> Self {
        LeafCheck::EqualsAnchor {
            anchor: anchor.to_string(),
            scalar: ScalarKind::Ptr,
        }
    }

    pub fn evaluate<R: ReadMemory + ?Sized>(&self, ctx: &CheckContext<'_, R>, address: Address) -> bool {
        let memory = ctx.memory;
        match self {
            LeafCheck::NonNull => memory.try_read_ptr(address).is_some_and(|v| v != 0),
            LeafCheck::Readable { len } => address != 0 && memory.is_readable(address, *len),
            LeafCheck::Equals { value, scalar } => {
                memory.try_read_scalar(address, *scalar) == Some(*value)
            }
            LeafCheck::EqualsAnchor { anchor, scalar } => {
                let Some(expected) = ctx.sample.anchor(anchor).and_then(|a| a.as_u64()) else {
                    return false;
                };
                memory.try_read_scalar(address, *scalar) == Some(expected)
            }
            LeafCheck::Text { anchor, encoding } => {
                let Some(expected) = ctx.sample.anchor(anchor).and_then(|a| a.as_text()) else {
                    return false;
                };
                memory
                    .try_read_string(address, *encoding, ctx.max_string_len)
                    .is_some_and(|text| text == expected)
            }
            LeafCheck::Aligned { align } => memory
                .try_read_ptr(address)
                .is_some_and(|v| v != 0 && *align != 0 && v % align == 0),
            LeafCheck::Deref { then } => match memory.try_read_ptr(address) {
                Some(target) if target != 0 => then.evaluate(ctx, target),
                _ => false,
            },
            LeafCheck::At { offset, then } => {
                let moved = address.wrapping_add_signed(*offset) & memory.pointer_width().mask();
                then.evaluate(ctx, moved)
            }
            LeafCheck::All { checks } => checks.iter().all(|check| check.evaluate(ctx, address)),
        }
    }
}

/// Why a sample rejected a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unresolved,
    CheckFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected { sample: SampleKey, reason: Rejection },
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accepted => write!(f, "accepted"),
            Verdict::Rejected {
                sample,
                reason: Rejection::Unresolved,
            } => write!(f, "unresolved on sample {}", sample),
            Verdict::Rejected {
                sample,
                reason: Rejection::CheckFailed,
            } => write!(f, "check failed on sample {}", sample),
        }
    }
}

/// Replays candidate chains on every sample of a pool
pub struct CrossSampleVerifier<'a, R: ReadMemory + ?Sized> {
    memory: &'a R,
    min_pool_size: usize,
    max_string_len: usize,
}

impl<'a, R: ReadMemory + ?Sized> CrossSampleVerifier<'a, R> {
    pub fn new(memory: &'a R) -> Self {
        Self {
            memory,
            min_pool_size: MIN_POOL_SIZE,
            max_string_len: MAX_STRING_LEN,
        }
    }

    pub fn with_limits(mut self, min_pool_size: usize, max_string_len: usize) -> Self {
        self.min_pool_size = min_pool_size;
        self.max_string_len = max_string_len;
        self
    }

    /// Rebase `chain` onto each sample, resolve, and apply `accept` to the
    /// resolved address. The first failing sample rejects the chain.
    pub fn verify_with<F>(&self, chain: &Chain, pool: &[Arc<Sample>], mut accept: F) -> Result<Verdict>
    where
        F: FnMut(Address, &Sample) -> bool,
    {
        if pool.len() < self.min_pool_size {
            return Err(Error::PoolTooSmall {
                required: self.min_pool_size,
                actual: pool.len(),
            });
        }

        for sample in pool {
            let reason = match chain.rebase(sample.base).resolve(self.memory) {
                Resolved::Unresolved => Rejection::Unresolved,
                Resolved::Address(address) if accept(address, sample) => continue,
                Resolved::Address(_) => Rejection::CheckFailed,
            };
            return Ok(Verdict::Rejected {
                sample: sample.key,
                reason,
            });
        }
        Ok(Verdict::Accepted)
    }

    pub fn verify(&self, chain: &Chain, pool: &[Arc<Sample>], check: &LeafCheck) -> Result<Verdict> {
        self.verify_with(chain, pool, |address, sample| {
            check.evaluate(&self.context(sample), address)
        })
    }

    /// First candidate, in order, that every sample accepts
    pub fn first_verified<I>(&self, candidates: I, pool: &[Arc<Sample>], check: &LeafCheck) -> Result<Option<Chain>>
    where
        I: IntoIterator<Item = Chain>,
    {
        for candidate in candidates {
            let verdict = self.verify(&candidate, pool, check)?;
            if verdict.is_accepted() {
                debug!("  verified {} across {} samples", candidate, pool.len());
                return Ok(Some(candidate));
            }
            debug!("  discarded {}: {}", candidate, verdict);
        }
        Ok(None)
    }

    pub fn context<'s>(&'s self, sample: &'s Sample) -> CheckContext<'s, R> {
        CheckContext {
            memory: self.memory,
            sample,
            max_string_len: self.max_string_len,
        }
    }
}
