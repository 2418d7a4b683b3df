//! # Encoding Module
//!
//! This module provides the text encoding used for chunk payloads:
//!
//! - **Integer encoding**: Zigzag 6-bit digits for tree indices, keys and counters
//! - **String encoding**: Unpadded 3-bytes-to-4-digits encoding for map keys
//! - **Cursor**: Forward-only reader used by every chunk decoder

pub mod base64;

pub use base64::{
    decode_int, decode_long, decode_str, encode_int, encode_long, encode_str, Cursor,
};
