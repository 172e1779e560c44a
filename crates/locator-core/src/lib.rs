//! # locator-core
//!
//! Blind discovery of memory offsets inside undocumented runtime structures.
//!
//! This crate provides:
//! - Pointer chains and bounded candidate sets
//! - Single-level value scans and multi-level template scans
//! - Cross-sample verification against trusted anchors
//! - Per-variant profiles, built lazily and replayed against live instances
//! - Memory snapshots and capture files for offline analysis

pub mod capture;
pub mod error;
pub mod locator;
pub mod memory;
pub mod offset;
pub mod profile;
pub mod record;
pub mod sample;

pub use capture::CaptureFile;
pub use error::{Error, Result};
pub use locator::{Locator, LocatorConfig, LocatorConfigBuilder, Outcome, RuntimeAccessor};
pub use memory::{
    Address, CompiledLayout, MemorySnapshot, PointerWidth, ReadMemory, RecordLayout, ScalarKind,
    StringEncoding,
};
pub use offset::{
    Candidates, Chain, CrossSampleVerifier, LeafCheck, OffsetSearcher, Resolved, ScanStats,
    Verdict,
};
pub use profile::{
    DiscoveryPlan, FieldChain, Profile, ProfileRegistry, ProfileStore, ReadAs, SlotState, Step,
    VariantPlan, builtin_plan, load_plan, save_plan,
};
pub use record::{FieldValue, ResultRecord};
pub use sample::{AnchorValue, Format, Sample, SampleKey, SamplePool, SampleProvider, Storage};
