//! Offset scanners
//!
//! [`OffsetSearcher::scan_value`] narrows one level by comparing against a
//! known value; [`OffsetSearcher::scan_templates`] composes several levels by
//! depth-first search. Neither claims a match is correct; candidates go
//! through [`CrossSampleVerifier`] before they are trusted.

pub mod constants;
pub mod validation;

use tracing::debug;

use crate::memory::{Address, ReadMemory};
use crate::offset::Chain;

pub use validation::{CrossSampleVerifier, LeafCheck, Verdict};

/// Counters collected while scanning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Slots whose pointer read was attempted
    pub visited: usize,
    /// Slots that could not be read, pruning their subtree
    pub pruned: usize,
    /// Slots handed to a leaf predicate
    pub leaves: usize,
    /// Chains emitted
    pub matches: usize,
}

impl ScanStats {
    /// Work done since `earlier` was taken from the same searcher
    pub fn since(&self, earlier: &ScanStats) -> ScanStats {
        ScanStats {
            visited: self.visited.saturating_sub(earlier.visited),
            pruned: self.pruned.saturating_sub(earlier.pruned),
            leaves: self.leaves.saturating_sub(earlier.leaves),
            matches: self.matches.saturating_sub(earlier.matches),
        }
    }
}

struct Frame {
    base: Address,
    /// Index of the next candidate to try at this level
    next: usize,
}

pub struct OffsetSearcher<'a, R: ReadMemory + ?Sized> {
    reader: &'a R,
    stats: ScanStats,
}

impl<'a, R: ReadMemory + ?Sized> OffsetSearcher<'a, R> {
    pub fn new(reader: &'a R) -> Self {
        Self {
            reader,
            stats: ScanStats::default(),
        }
    }

    /// Counters accumulated over every scan run by this searcher
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Offsets at which a pointer-width read from `anchor + offset` equals `target`.
    ///
    /// All matches are returned in candidate order; disambiguation is left to
    /// verification.
    pub fn scan_value(&mut self, anchor: Address, offsets: &[u32], target: u64) -> Vec<u32> {
        let width = self.reader.pointer_width();
        let found: Vec<u32> = offsets
            .iter()
            .copied()
            .filter(|&offset| {
                self.stats.visited += 1;
                match self.reader.try_read_ptr(width.offset(anchor, offset)) {
                    Some(value) => value == target,
                    None => {
                        self.stats.pruned += 1;
                        false
                    }
                }
            })
            .collect();

        self.stats.matches += found.len();
        debug!(
            "Value scan from 0x{:X} for 0x{:X}: {} of {} offsets matched",
            anchor,
            target,
            found.len(),
            offsets.len()
        );
        found
    }

    /// Depth-first search over one candidate list per level, outer to inner.
    ///
    /// At every level the slot `base + offset` must hold a readable pointer.
    /// Inner levels continue from the pointer read; at the last level the
    /// slot address is passed to `leaf`, and each accepted slot emits the
    /// full offset list as a template chain. The search does not stop at the
    /// first match. Unreadable slots prune their subtree.
    pub fn scan_templates<F>(&mut self, base: Address, levels: &[Vec<u32>], mut leaf: F) -> Vec<Chain>
    where
        F: FnMut(Address) -> bool,
    {
        let mut chains = Vec::new();
        if levels.is_empty() {
            return chains;
        }

        let width = self.reader.pointer_width();
        let before = self.stats;
        let mut stack = vec![Frame { base, next: 0 }];

        while let Some(depth) = stack.len().checked_sub(1) {
            let candidates = &levels[depth];
            let frame = &mut stack[depth];
            if frame.next == candidates.len() {
                stack.pop();
                continue;
            }

            let slot = width.offset(frame.base, candidates[frame.next]);
            frame.next += 1;
            self.stats.visited += 1;

            let Some(value) = self.reader.try_read_ptr(slot) else {
                self.stats.pruned += 1;
                continue;
            };

            if depth + 1 < levels.len() {
                stack.push(Frame {
                    base: value,
                    next: 0,
                });
                continue;
            }

            self.stats.leaves += 1;
            if leaf(slot) {
                let offsets: Vec<u32> = stack
                    .iter()
                    .zip(levels)
                    .map(|(frame, candidates)| candidates[frame.next - 1])
                    .collect();
                debug!("  template match: {:X?}", offsets);
                self.stats.matches += 1;
                chains.push(Chain::template(offsets));
            }
        }

        let scan = self.stats.since(&before);
        debug!(
            "Template scan from 0x{:X} over {} levels: {} chains ({} slots visited, {} pruned)",
            base,
            levels.len(),
            chains.len(),
            scan.visited,
            scan.pruned
        );
        chains
    }
}
