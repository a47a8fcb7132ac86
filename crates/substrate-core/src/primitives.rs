//! # Substrate Primitives
//!
//! Compiled-in constants for the substrate.
//!
//! Identity and geometry constants are part of the persisted contract:
//! changing any of them changes every hash or position derived from them,
//! so they move only together with `HASH_SCHEME_VERSION`.

/// Version of the hash domain-separation contract (see `hashing`).
pub const HASH_SCHEME_VERSION: u32 = 1;

/// Version of the redb table layout.
pub const SCHEMA_VERSION: u64 = 1;

/// Size of the Unicode codepoint space (U+0000 ..= U+10FFFF).
pub const CODEPOINT_SPACE: u32 = 0x11_0000;

/// Bits per axis of the 4D Hilbert index (4 x 16 = 64-bit keys).
pub const HILBERT_BITS: u32 = 16;

/// Stored sphere points must have `| |p| - 1 | <= UNIT_NORM_TOLERANCE`.
pub const UNIT_NORM_TOLERANCE: f64 = 1e-9;

/// A mean vector shorter than this has no direction (e.g. antipodal pair).
pub const DEGENERATE_NORM: f64 = 1e-12;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum byte length of one record's text.
///
/// Records longer than this are skipped as malformed.
pub const MAX_TEXT_LENGTH: usize = 65536;

/// Maximum number of tokens in one record.
pub const MAX_RECORD_TOKENS: usize = 10000;

// =============================================================================
// PIPELINE DEFAULTS
// =============================================================================

/// Item-count threshold at which a batch is handed to the writer.
pub const DEFAULT_BATCH_SIZE: usize = 50_000;

/// Capacity of the producer -> writer queue, in batches.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

/// Records per compute partition.
pub const DEFAULT_PARTITION_SIZE: usize = 1024;

/// Word and phrase strings the text memo holds before it is cleared.
pub const DEFAULT_TEXT_MEMO: usize = 1 << 18;

/// Codepoints per partition during atom bootstrap.
pub const ATOM_SEED_PARTITION: u32 = 4096;

// =============================================================================
// WALK DEFAULTS
// =============================================================================

/// Starting energy of a walk.
pub const DEFAULT_WALK_ENERGY: f64 = 32.0;

/// Energy deducted per step.
pub const DEFAULT_STEP_COST: f64 = 1.0;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f64 = 1.0;

/// Temperatures below this select greedily.
pub const GREEDY_TEMPERATURE: f64 = 1e-6;

/// Rating points that correspond to one unit of temperature.
pub const RATING_TEMPERATURE_SCALE: f64 = 100.0;

/// Hard cap on the number of steps of one walk.
pub const MAX_WALK_STEPS: usize = 1000;
