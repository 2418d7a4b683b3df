//! # chronostore Configuration Module
//!
//! This module centralizes all configuration constants. Constants are grouped
//! by their functional area and interdependencies are documented and enforced
//! through compile-time assertions.
//!
//! ## Module Organization
//!
//! - [`constants`]: Sentinels, key layout, growth factors and cache sizing

pub mod constants;
pub use constants::*;
