//! Search and verification constants
//!
//! Scan ranges are not here: they belong to the discovery plan, where they
//! can be widened per runtime without touching the scanners.

/// Minimum number of samples a chain must agree on before it is accepted.
///
/// ```text
///   storage:   file ─┬─ memory
///   format:    one or more per variant
///   replicate: 0 .. replicates
///
///   pool = storages × formats × replicates  (≥ MIN_POOL_SIZE)
/// ```
pub const MIN_POOL_SIZE: usize = 5;

/// Replicates built per axis combination
pub const DEFAULT_REPLICATES: u8 = 5;

/// Upper bound for string reads, in bytes
pub const MAX_STRING_LEN: usize = 4096;

/// Alignment of module images; a plausible image base has its low 16 bits clear
pub const IMAGE_BASE_ALIGNMENT: u64 = 0x1_0000;

/// Upper bound on the offsets one candidate set may expand to
pub const MAX_CANDIDATES: usize = 0x4000;

/// Stride of pointer-aligned scans in 32-bit and 64-bit targets alike
pub const SCAN_STRIDE: u32 = 4;
