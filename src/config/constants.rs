//! # chronostore Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! KEY_BITS (53)
//!       │
//!       ├─> PREFIX_BITS (16, peer prefix width)
//!       │
//!       ├─> COUNTER_BITS (derived: KEY_BITS - PREFIX_BITS)
//!       │     Every minted id stays below 2^53, so it never reaches the
//!       │     sentinel range.
//!       │
//!       └─> END_OF_TIME / BEGINNING_OF_TIME (±(2^53 - 2))
//!             NULL_LONG (2^53 + 1) sits outside both.
//!
//! CACHE_LOAD_FACTOR (0.75)
//!       │
//!       ├─> OrderedIndex growth threshold (capacity × factor)
//!       │
//!       └─> Hash map chunk growth threshold (capacity × factor)
//!
//! DEFAULT_CACHE_SIZE (100,000 chunks)
//!       │
//!       └─> MIN_CACHE_SIZE (must be <=)
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `COUNTER_BITS + PREFIX_BITS == KEY_BITS` (derived correctly)
//! 2. Every id minted under a non-negative prefix is below `END_OF_TIME`
//!    (negative prefixes are bounded when the id is minted)
//! 3. `MIN_CACHE_SIZE <= DEFAULT_CACHE_SIZE`
//!
//! ## Usage
//!
//! ```ignore
//! use crate::config::{NULL_LONG, END_OF_TIME, CACHE_LOAD_FACTOR};
//! ```

// ============================================================================
// SENTINEL COORDINATE VALUES
// Reserved values used as wildcard and metadata markers, never real ids
// ============================================================================

/// Marker for "no value" in any coordinate component.
pub const NULL_LONG: i64 = 9_007_199_254_740_993;

/// Largest representable time; also tags counter records.
pub const END_OF_TIME: i64 = 0x001F_FFFF_FFFF_FFFE;

/// Smallest representable time.
pub const BEGINNING_OF_TIME: i64 = -0x001F_FFFF_FFFF_FFFE;

const _: () = assert!(
    NULL_LONG > END_OF_TIME && BEGINNING_OF_TIME == -END_OF_TIME,
    "sentinel values overlap"
);

// ============================================================================
// KEY LAYOUT
// Ids minted by a KeyCalculator are `prefix << COUNTER_BITS | counter`
// ============================================================================

/// Total width of a minted id.
pub const KEY_BITS: u32 = 53;

/// Width of the peer prefix.
pub const PREFIX_BITS: u32 = 16;

/// Width of the per-prefix counter.
pub const COUNTER_BITS: u32 = KEY_BITS - PREFIX_BITS;

/// Largest counter value a single prefix can reach.
pub const MAX_COUNTER: i64 = (1i64 << COUNTER_BITS) - 1;

const _: () = assert!(
    COUNTER_BITS + PREFIX_BITS == KEY_BITS,
    "COUNTER_BITS derivation mismatch"
);

const _: () = assert!(
    ((i16::MAX as i64) << COUNTER_BITS | MAX_COUNTER) < END_OF_TIME,
    "ids minted under a non-negative prefix must stay below END_OF_TIME"
);

// ============================================================================
// CHUNK GROWTH
// ============================================================================

/// Fraction of capacity a tree or hash map chunk may fill before growing.
pub const CACHE_LOAD_FACTOR: f64 = 0.75;

/// Capacity of a freshly created hash map chunk.
pub const MAP_INITIAL_CAPACITY: usize = 16;

/// Sentinel index for "no node" in the tree arena and "no slot" in chains.
pub const UNDEFINED: i32 = -1;

// ============================================================================
// CHUNK SPACE
// ============================================================================

/// Number of chunk slots allocated when the builder is left at its default.
pub const DEFAULT_CACHE_SIZE: usize = 100_000;

/// Smallest accepted cache size.
pub const MIN_CACHE_SIZE: usize = 1;

const _: () = assert!(
    MIN_CACHE_SIZE <= DEFAULT_CACHE_SIZE,
    "MIN_CACHE_SIZE must be <= DEFAULT_CACHE_SIZE"
);

// ============================================================================
// CHUNK FLAGS
// ============================================================================

/// Modified since the last write-back.
pub const DIRTY_BIT: u64 = 1;

/// Evicted or removed; contents must not be read.
pub const REMOVED_BIT: u64 = 1 << 1;
