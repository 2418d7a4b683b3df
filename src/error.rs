//! # Store Errors
//!
//! Every fallible operation in the crate returns `eyre::Result`. Conditions
//! that callers need to tell apart are raised as a [`StoreError`] and can be
//! recovered from the report with `downcast_ref`:
//!
//! ```ignore
//! match manager.precise_chunk(coord) {
//!     Err(e) if matches!(e.downcast_ref::<StoreError>(), Some(StoreError::CacheMiss { .. })) => {}
//!     other => { other?; }
//! }
//! ```
//!
//! | Variant             | Raised by                                   | Recoverable |
//! |---------------------|---------------------------------------------|-------------|
//! | `CapacityExhausted` | victim scan found only pinned chunks        | no          |
//! | `CacheMiss`         | a chunk expected to be resident was absent  | no          |
//! | `Decode`            | malformed payload handed to `Chunk::init`   | skip entry  |
//! | `NotConnected`      | key minting before `connect` completed      | yes         |
//! | `Unsupported`       | ordered index deletion                      | no          |
//! | `KeySpaceExhausted` | a prefix ran out of counter values          | reconnect   |
//! | `Driver`            | backing store reported a failure            | caller      |

use crate::chunk::Coord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    CapacityExhausted { capacity: usize },
    CacheMiss { coord: Coord },
    Decode { reason: String },
    NotConnected,
    Unsupported { operation: &'static str },
    KeySpaceExhausted { prefix: i16 },
    Driver { reason: String },
}

impl StoreError {
    pub fn decode(reason: impl Into<String>) -> Self {
        StoreError::Decode {
            reason: reason.into(),
        }
    }

    pub fn driver(reason: impl Into<String>) -> Self {
        StoreError::Driver {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::CapacityExhausted { capacity } => write!(
                f,
                "chunk space exhausted: all {} slots are pinned",
                capacity
            ),
            StoreError::CacheMiss { coord } => {
                write!(f, "cache miss: no resident chunk at {}", coord)
            }
            StoreError::Decode { reason } => write!(f, "malformed chunk payload: {}", reason),
            StoreError::NotConnected => write!(f, "data manager is not connected"),
            StoreError::Unsupported { operation } => {
                write!(f, "operation not supported: {}", operation)
            }
            StoreError::KeySpaceExhausted { prefix } => write!(
                f,
                "key space of prefix {} is exhausted, a new prefix is required",
                prefix
            ),
            StoreError::Driver { reason } => write!(f, "content delivery driver failed: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// Returns the [`StoreError`] carried anywhere in `report`'s chain.
pub fn store_error(report: &eyre::Report) -> Option<&StoreError> {
    report
        .chain()
        .find_map(|cause| cause.downcast_ref::<StoreError>())
}
