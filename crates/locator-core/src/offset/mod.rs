//! Offset discovery: chains, candidate sets, scanners and verification

pub mod candidates;
pub mod chain;
pub mod searcher;

pub use candidates::{Candidates, ExpandContext};
pub use chain::{Chain, Resolved};
pub use searcher::validation::{CheckContext, Rejection};
pub use searcher::{CrossSampleVerifier, LeafCheck, OffsetSearcher, ScanStats, Verdict};
